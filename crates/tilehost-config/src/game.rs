//! Game definitions and the game registry.
//!
//! A [`GameDefinition`] describes one playable game variant: which binary
//! to launch and where each user's files live. Paths are templates in
//! which [`USERNAME_PLACEHOLDER`] is replaced by the player's name when a
//! session starts.
//!
//! The [`GameRegistry`] is the read-only, ordered list of definitions plus
//! an id index. Order is the display order in the lobby.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Username};

/// Token replaced by the username in path and URL templates.
pub const USERNAME_PLACEHOLDER: &str = "%n";

/// One configured game variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameDefinition {
    /// Unique identifier, e.g. `dcss-gnollcrawl`.
    pub id: String,

    /// Name shown in the lobby.
    pub name: String,

    /// Executable launched for each session.
    #[serde(alias = "crawl_binary")]
    pub binary: PathBuf,

    /// Directory holding `<user>.rc`.
    pub rcfile_path: String,

    /// Directory handed to the game for macro files.
    pub macro_path: String,

    /// Directory receiving morgue files.
    pub morgue_path: String,

    /// Directory holding the in-progress marker while a game runs.
    pub inprogress_path: String,

    /// Directory receiving ttyrec recordings.
    pub ttyrec_path: String,

    /// Directory in which the game's local socket is created.
    pub socket_path: String,

    /// Client asset location announced to the browser.
    pub client_path: String,

    /// Public URL of the morgue directory, if any.
    #[serde(default)]
    pub morgue_url: Option<String>,

    /// Whether structured option data is forwarded to the client.
    #[serde(default = "default_send_json_options")]
    pub send_json_options: bool,

    /// Extra command-line arguments appended after the standard ones.
    #[serde(default)]
    pub options: Vec<String>,
}

fn default_send_json_options() -> bool {
    true
}

/// Per-user paths of a game, with the username substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub rcfile_dir: PathBuf,
    pub macro_dir: PathBuf,
    pub morgue_dir: PathBuf,
    pub inprogress_dir: PathBuf,
    pub ttyrec_dir: PathBuf,
    pub socket_dir: PathBuf,
    pub client_path: PathBuf,
    pub morgue_url: Option<String>,
}

impl ResolvedPaths {
    /// The rc file handed to the game: `<rcfile_dir>/<user>.rc`.
    pub fn rcfile(&self, username: &Username) -> PathBuf {
        self.rcfile_dir.join(format!("{username}.rc"))
    }
}

impl GameDefinition {
    /// Substitutes `username` into every path template.
    ///
    /// `Username` values are single path components, so the result can
    /// only extend the template's own directory; it never climbs out of it.
    pub fn resolve(&self, username: &Username) -> ResolvedPaths {
        ResolvedPaths {
            rcfile_dir: substitute_path(&self.rcfile_path, username),
            macro_dir: substitute_path(&self.macro_path, username),
            morgue_dir: substitute_path(&self.morgue_path, username),
            inprogress_dir: substitute_path(&self.inprogress_path, username),
            ttyrec_dir: substitute_path(&self.ttyrec_path, username),
            socket_dir: substitute_path(&self.socket_path, username),
            client_path: substitute_path(&self.client_path, username),
            morgue_url: self
                .morgue_url
                .as_deref()
                .map(|url| substitute(url, username)),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidGame {
            game: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if self.binary.as_os_str().is_empty() {
            return Err(invalid("binary must not be empty"));
        }
        for (field, template) in [
            ("rcfile_path", &self.rcfile_path),
            ("macro_path", &self.macro_path),
            ("morgue_path", &self.morgue_path),
            ("inprogress_path", &self.inprogress_path),
            ("ttyrec_path", &self.ttyrec_path),
            ("socket_path", &self.socket_path),
        ] {
            if template.is_empty() {
                return Err(invalid(&format!("{field} must not be empty")));
            }
        }
        Ok(())
    }
}

/// Replaces every placeholder in `template` with `username`.
pub fn substitute(template: &str, username: &Username) -> String {
    template.replace(USERNAME_PLACEHOLDER, username.as_str())
}

fn substitute_path(template: &str, username: &Username) -> PathBuf {
    PathBuf::from(substitute(template, username))
}

// ---------------------------------------------------------------------------
// GameRegistry
// ---------------------------------------------------------------------------

/// Ordered, read-only collection of game definitions.
///
/// Built once at startup. Cloning is cheap: definitions are shared.
#[derive(Debug, Clone, Default)]
pub struct GameRegistry {
    games: Vec<Arc<GameDefinition>>,
    index: HashMap<String, usize>,
}

impl GameRegistry {
    /// Builds the registry, keeping the given order.
    ///
    /// # Errors
    /// [`ConfigError::DuplicateGame`] if two definitions share an id, or
    /// [`ConfigError::InvalidGame`] if a definition is unusable.
    pub fn new(definitions: Vec<GameDefinition>) -> Result<Self, ConfigError> {
        let mut games = Vec::with_capacity(definitions.len());
        let mut index = HashMap::with_capacity(definitions.len());

        for definition in definitions {
            definition.validate()?;
            if index.contains_key(&definition.id) {
                return Err(ConfigError::DuplicateGame(definition.id));
            }
            index.insert(definition.id.clone(), games.len());
            games.push(Arc::new(definition));
        }

        Ok(Self { games, index })
    }

    /// Looks up a game by id.
    pub fn get(&self, id: &str) -> Option<&Arc<GameDefinition>> {
        self.index.get(id).map(|&i| &self.games[i])
    }

    /// Iterates over games in display order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<GameDefinition>> {
        self.games.iter()
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Component, Path};

    use super::*;
    use crate::UsernamePolicy;

    fn gnollcrawl() -> GameDefinition {
        GameDefinition {
            id: "dcss-gnollcrawl".into(),
            name: "GnollCrawl".into(),
            binary: "./crawl".into(),
            rcfile_path: "/home/crawl/rcs/gnollcrawl/%n".into(),
            macro_path: "/home/crawl/rcs/gnollcrawl/%n".into(),
            morgue_path: "/home/crawl/rcs/gnollcrawl/%n/morgues".into(),
            inprogress_path: "/home/crawl/inprogress/gnollcrawl/%n/running".into(),
            ttyrec_path: "/home/crawl/rcs/gnollcrawl/%n/ttyrecs".into(),
            socket_path: "/home/crawl/rcs/gnollcrawl/%n".into(),
            client_path: "./webserver/game_data/".into(),
            morgue_url: Some("gnollcrawl.tk/gnollcrawl/%n/morgues/".into()),
            send_json_options: true,
            options: vec![],
        }
    }

    fn game(id: &str) -> GameDefinition {
        GameDefinition {
            id: id.into(),
            ..gnollcrawl()
        }
    }

    fn alice() -> Username {
        UsernamePolicy::default().parse("Alice").unwrap()
    }

    #[test]
    fn test_resolve_substitutes_every_template() {
        let paths = gnollcrawl().resolve(&alice());
        assert_eq!(paths.rcfile_dir, Path::new("/home/crawl/rcs/gnollcrawl/Alice"));
        assert_eq!(
            paths.morgue_dir,
            Path::new("/home/crawl/rcs/gnollcrawl/Alice/morgues")
        );
        assert_eq!(
            paths.inprogress_dir,
            Path::new("/home/crawl/inprogress/gnollcrawl/Alice/running")
        );
        assert_eq!(
            paths.morgue_url.as_deref(),
            Some("gnollcrawl.tk/gnollcrawl/Alice/morgues/")
        );
        assert_eq!(
            paths.rcfile(&alice()),
            Path::new("/home/crawl/rcs/gnollcrawl/Alice/Alice.rc")
        );
    }

    #[test]
    fn test_resolve_never_leaves_base_directory() {
        // Every name the default policy accepts must resolve to a path
        // that starts with the template's base and adds only normal
        // components.
        let policy = UsernamePolicy::default();
        let base = Path::new("/home/crawl/rcs/gnollcrawl");
        let samples = ["abc", "Alice", "ZZZZZZZZZZZZZZZZZZZZ", "a1b2c3", "000"];
        for raw in samples {
            let name = policy.parse(raw).unwrap();
            let resolved = gnollcrawl().resolve(&name).socket_dir;
            let rest = resolved.strip_prefix(base).expect("stays under base");
            assert!(
                rest.components().all(|c| matches!(c, Component::Normal(_))),
                "{resolved:?} escapes {base:?}"
            );
            assert!(!resolved.to_string_lossy().contains(".."));
        }
    }

    #[test]
    fn test_registry_preserves_order_and_indexes() {
        let registry =
            GameRegistry::new(vec![game("b"), game("a"), game("c")]).unwrap();
        let ids: Vec<&str> = registry.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, ["b", "a", "c"]);
        assert_eq!(registry.get("a").unwrap().id, "a");
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_registry_duplicate_id_is_error() {
        let result = GameRegistry::new(vec![game("dup"), game("other"), game("dup")]);
        assert!(matches!(result, Err(ConfigError::DuplicateGame(id)) if id == "dup"));
    }

    #[test]
    fn test_registry_empty_id_is_error() {
        let result = GameRegistry::new(vec![game("  ")]);
        assert!(matches!(result, Err(ConfigError::InvalidGame { .. })));
    }
}
