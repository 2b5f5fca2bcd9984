use clap::Parser;

use crate::relay::RelayPolicy;

#[derive(Debug, Parser, Clone)]
#[command(name = "maush-relay")]
#[command(about = "Relays chat-room scripts to a maush backend and posts the output back")]
pub struct Config {
    /// Base URL of the Matrix homeserver.
    #[arg(long, env = "MAUSH_HOMESERVER")]
    pub homeserver: String,

    #[arg(long, env = "MAUSH_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: String,

    /// Fully qualified user id the access token belongs to.
    #[arg(long, env = "MAUSH_USER_ID")]
    pub user_id: String,

    #[arg(long, env = "MAUSH_BACKEND_URL", default_value = "http://localhost:8080/exec")]
    pub backend_url: String,

    /// Comma-separated room ids the relay answers in.
    #[arg(long, env = "MAUSH_ROOMS", default_value = "")]
    pub rooms: String,

    #[arg(long, env = "MAUSH_ADMINS", default_value = "")]
    pub admins: String,

    #[arg(long, env = "MAUSH_UNTRUSTED", default_value = "")]
    pub untrusted: String,

    #[arg(long, default_value = "!")]
    pub command_prefix: String,

    #[arg(long, default_value_t = 30_000)]
    pub sync_timeout_ms: u64,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn rooms_vec(&self) -> Vec<String> {
        split_list(&self.rooms)
    }

    pub fn admins_vec(&self) -> Vec<String> {
        split_list(&self.admins)
    }

    pub fn untrusted_vec(&self) -> Vec<String> {
        split_list(&self.untrusted)
    }

    pub fn relay_policy(&self) -> RelayPolicy {
        RelayPolicy {
            rooms: self.rooms_vec().into_iter().collect(),
            admins: self.admins_vec().into_iter().collect(),
            untrusted: self.untrusted_vec().into_iter().collect(),
            command_prefix: self.command_prefix.clone(),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::Config;
    use clap::Parser;

    fn parse(extra: &[&str]) -> Config {
        let mut argv = vec![
            "maush-relay",
            "--homeserver",
            "https://matrix.example.org",
            "--access-token",
            "syt_token",
            "--user-id",
            "@maush:example.org",
        ];
        argv.extend_from_slice(extra);
        Config::parse_from(argv)
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = parse(&[]);
        assert_eq!(cfg.backend_url, "http://localhost:8080/exec");
        assert_eq!(cfg.command_prefix, "!");
        assert_eq!(cfg.sync_timeout_ms, 30_000);
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.rooms_vec().is_empty());
    }

    #[test]
    fn lists_are_split_and_trimmed() {
        let cfg = parse(&[
            "--rooms",
            "!a:example.org, !b:example.org,,",
            "--admins",
            "@root:example.org",
        ]);
        assert_eq!(cfg.rooms_vec(), vec!["!a:example.org", "!b:example.org"]);

        let policy = cfg.relay_policy();
        assert!(policy.rooms.contains("!b:example.org"));
        assert!(policy.admins.contains("@root:example.org"));
        assert!(policy.untrusted.is_empty());
    }
}
