use std::io::Write;
use std::path::Path;

use tilehost_config::{ConfigError, CryptAlgorithm, ListenerEndpoint, ServerConfig};

fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("tilehost.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(body.as_bytes()).unwrap();
    path
}

const GAMES: &str = r#"
[[games]]
id = "dcss-gnollcrawl"
name = "GnollCrawl"
crawl_binary = "./crawl"
rcfile_path = "/srv/rcs/gnollcrawl/%n"
macro_path = "/srv/rcs/gnollcrawl/%n"
morgue_path = "/srv/rcs/gnollcrawl/%n/morgues"
inprogress_path = "/srv/inprogress/gnollcrawl/%n"
ttyrec_path = "/srv/rcs/gnollcrawl/%n/ttyrecs"
socket_path = "/srv/rcs/gnollcrawl/%n"
client_path = "./game_data/"
options = ["-extra-opt-first", "-extra-opt-last"]

[[games]]
id = "dcss-trunk"
name = "DCSS trunk"
binary = "/usr/games/crawl"
rcfile_path = "/srv/rcs/trunk"
macro_path = "/srv/rcs/trunk"
morgue_path = "/srv/rcs/trunk/%n"
inprogress_path = "/srv/inprogress/trunk"
ttyrec_path = "/srv/rcs/trunk/%n"
socket_path = "/srv/sockets"
client_path = "./game_data/"
send_json_options = false
"#;

#[test]
fn test_load_full_file_with_tls() {
    let dir = tempfile::tempdir().unwrap();
    let cert = dir.path().join("cert.pem");
    let key = dir.path().join("key.pem");
    std::fs::write(&cert, "cert").unwrap();
    std::fs::write(&key, "key").unwrap();

    let body = format!(
        r#"
[server]
server_id = "test"
max_connections = 3
connection_timeout = 30

[listen]
bind_pairs = [["127.0.0.1", 18080], ["localhost", 18082]]

[tls]
certfile = "{cert}"
keyfile = "{key}"
port = 18443

[auth]
crypt_algorithm = "sha512"
crypt_salt_length = 16
login_token_lifetime = 2

[logging]
level = "debug"
json_format = true
{GAMES}"#,
        cert = cert.display(),
        key = key.display(),
    );
    let path = write_config(dir.path(), &body);

    let config = ServerConfig::load(&path).expect("valid config");
    assert_eq!(config.server.server_id, "test");
    assert_eq!(config.server.max_connections, 3);
    assert_eq!(config.auth.crypt_algorithm, CryptAlgorithm::Sha512);
    assert!(config.logging.json_format);
    assert_eq!(
        config.endpoints(),
        &[
            ListenerEndpoint::plain("127.0.0.1", 18080),
            ListenerEndpoint::plain("localhost", 18082),
            ListenerEndpoint::tls("", 18443),
        ]
    );

    let ids: Vec<&str> = config.games().iter().map(|g| g.id.as_str()).collect();
    assert_eq!(ids, ["dcss-gnollcrawl", "dcss-trunk"]);
    let trunk = config.games().get("dcss-trunk").unwrap();
    assert!(!trunk.send_json_options);
    let gnoll = config.games().get("dcss-gnollcrawl").unwrap();
    assert_eq!(gnoll.options.len(), 2);
}

#[test]
fn test_load_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = ServerConfig::load(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(ConfigError::Io { .. })));
}

#[test]
fn test_load_wrong_type_is_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), &format!("[server]\nmax_connections = \"many\"\n{GAMES}"));
    assert!(matches!(ServerConfig::load(&path), Err(ConfigError::Parse(_))));
}

#[test]
fn test_nick_policy_follows_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        &format!("[auth]\nnick_regex = '^[a-z]{{2,4}}$'\n{GAMES}"),
    );
    let config = ServerConfig::load(&path).unwrap();
    assert!(config.nick_policy().parse("ab").is_ok());
    assert!(config.nick_policy().parse("Alice").is_err());
}
