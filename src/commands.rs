//! Parsing message bodies into executions.

use crate::protocol::ExecMode;

/// What a message asks the backend to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCommand {
    pub mode: ExecMode,
    pub script: String,
    /// Requires the sender to be an admin.
    pub admin: bool,
    /// Identity to run as instead of the sender (`sudo`).
    pub acting_as: Option<String>,
}

impl ExecCommand {
    fn language(language: &str, script: &str) -> Self {
        Self {
            mode: ExecMode::Language(language.to_string()),
            script: script.to_string(),
            admin: false,
            acting_as: None,
        }
    }
}

/// Parse `body` into a command, or `None` if it is not one.
///
/// `!!cmd args` and `!?cmd args` run `cmd` directly; `!?` splits arguments
/// with shell quoting. Anything after the first blank line becomes stdin.
/// Named commands are `<prefix><name> <script>`.
pub fn parse(body: &str, prefix: &str) -> Option<ExecCommand> {
    if body.starts_with("!!") || body.starts_with("!?") {
        return parse_raw(body);
    }
    parse_named(body.strip_prefix(prefix)?)
}

fn parse_raw(body: &str) -> Option<ExecCommand> {
    let (first, stdin) = body.split_once("\n\n").unwrap_or((body, ""));
    let (head, rest) = match first.split_once(' ') {
        Some((head, rest)) => (head, Some(rest)),
        None => (first, None),
    };
    let (marker, language) = head.split_at(2);

    let mut args = vec![language.to_string()];
    if let Some(rest) = rest {
        if marker == "!?" {
            args.extend(shlex::split(rest)?);
        } else {
            args.extend(rest.split(' ').map(ToOwned::to_owned));
        }
    }

    Some(ExecCommand {
        mode: ExecMode::Raw {
            language: language.to_string(),
            args,
        },
        script: stdin.to_string(),
        admin: false,
        acting_as: None,
    })
}

fn parse_named(invocation: &str) -> Option<ExecCommand> {
    let (name, script) = split_word(invocation);
    let script = script?;

    let command = match name {
        "sh" | "shell" => ExecCommand::language("sh", script),
        "py" | "python" => ExecCommand::language("python", script),
        "js" | "javascript" | "node" => ExecCommand::language("node.js", script),
        "el" | "execline" => ExecCommand::language("execline", script),
        "admin-sh" | "su" => ExecCommand {
            admin: true,
            ..ExecCommand::language("sh", script)
        },
        "sudo" => {
            let (user_id, script) = split_word(script);
            ExecCommand {
                admin: true,
                acting_as: Some(user_id.to_string()),
                ..ExecCommand::language("sh", script?)
            }
        }
        _ => return None,
    };
    Some(command)
}

/// First whitespace-delimited word and the non-empty remainder, if any.
fn split_word(text: &str) -> (&str, Option<&str>) {
    match text.split_once(char::is_whitespace) {
        Some((word, rest)) => {
            let rest = rest.trim_start();
            (word, (!rest.is_empty()).then_some(rest))
        }
        None => (text, None),
    }
}
