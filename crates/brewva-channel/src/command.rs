//! The channel text command surface.
//!
//! `@name <task>` routes a task to one agent; `/commands` drive the
//! registry and the coordinator. Anything else is plain conversation and
//! flows to the focused agent.

use std::sync::LazyLock;

use brewva_core::normalize_agent_id;
use regex::Regex;

static MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^@(\w[\w._-]*)[,:]?\s+(.+)$").expect("invalid regex"));

/// Outcome of matching one inbound text against the command grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandMatch {
    /// Not a command; route to the focused agent.
    None,
    /// Recognizably a command, but malformed. Carries a usage hint.
    Error {
        /// The usage hint shown to the user.
        message: String,
    },
    /// `@name <task>`: run one task on one agent.
    RouteAgent {
        /// Normalized target agent.
        agent_id: String,
        /// The task text.
        task: String,
    },
    /// `/agents`.
    ListAgents,
    /// `/new-agent <name> [model=<provider/id>]`.
    NewAgent {
        /// Requested agent name (pre-normalization).
        name: String,
        /// Optional model override.
        model: Option<String>,
    },
    /// `/del-agent <name>`.
    DeleteAgent {
        /// Target agent name.
        name: String,
    },
    /// `/focus @name`.
    Focus {
        /// Target agent name.
        name: String,
    },
    /// `/run @a,@b <task>`.
    Run {
        /// Target agents in list order.
        agent_ids: Vec<String>,
        /// The task text.
        task: String,
    },
    /// `/discuss @a,@b [maxRounds=N] <topic>`.
    Discuss {
        /// Participants in list order.
        agent_ids: Vec<String>,
        /// Optional round cap from the command.
        max_rounds: Option<u32>,
        /// The topic text.
        topic: String,
    },
}

impl CommandMatch {
    /// Whether this match requires the sender to pass the owner ACL.
    /// Route-agent and the agents listing are open to everyone.
    #[must_use]
    pub fn requires_owner(&self) -> bool {
        matches!(
            self,
            Self::NewAgent { .. }
                | Self::DeleteAgent { .. }
                | Self::Focus { .. }
                | Self::Run { .. }
                | Self::Discuss { .. }
        )
    }
}

fn usage(message: &str) -> CommandMatch {
    CommandMatch::Error {
        message: message.to_string(),
    }
}

/// Parse an agent list like `@a,@b,c`.
fn parse_agent_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|part| normalize_agent_id(part.trim().trim_start_matches('@')))
        .collect()
}

/// Match one inbound text against the command grammar.
#[must_use]
pub fn route_command(input: &str) -> CommandMatch {
    let input = input.trim();

    if input.starts_with('@') {
        if let Some(caps) = MENTION.captures(input) {
            let Some(agent_id) = normalize_agent_id(&caps[1]) else {
                return usage("usage: @agent <task>");
            };
            return CommandMatch::RouteAgent {
                agent_id,
                task: caps[2].trim().to_string(),
            };
        }
        return usage("usage: @agent <task>");
    }

    if !input.starts_with('/') {
        return CommandMatch::None;
    }

    let mut words = input.split_whitespace();
    let command = words.next().unwrap_or("");
    let rest = input[command.len()..].trim();

    match command {
        "/agents" => CommandMatch::ListAgents,
        "/new-agent" => parse_new_agent(rest),
        "/del-agent" => {
            if rest.is_empty() || rest.contains(char::is_whitespace) {
                usage("usage: /del-agent <name>")
            } else {
                CommandMatch::DeleteAgent {
                    name: rest.trim_start_matches('@').to_string(),
                }
            }
        },
        "/focus" => {
            if rest.is_empty() || rest.contains(char::is_whitespace) {
                usage("usage: /focus @name")
            } else {
                CommandMatch::Focus {
                    name: rest.trim_start_matches('@').to_string(),
                }
            }
        },
        "/run" => {
            let mut parts = rest.splitn(2, char::is_whitespace);
            let agent_ids = parse_agent_list(parts.next().unwrap_or(""));
            let task = parts.next().map(str::trim).unwrap_or("");
            if agent_ids.is_empty() || task.is_empty() {
                usage("usage: /run @a,@b <task>")
            } else {
                CommandMatch::Run {
                    agent_ids,
                    task: task.to_string(),
                }
            }
        },
        "/discuss" => parse_discuss(rest),
        _ => usage("unknown command; try /agents, /new-agent, /del-agent, /focus, /run, /discuss"),
    }
}

/// `/new-agent jack`, `/new-agent name is jack`, `/new-agent name=jack`,
/// each with an optional trailing `model=<provider/id>`.
fn parse_new_agent(rest: &str) -> CommandMatch {
    let mut model = None;
    let mut name_words: Vec<&str> = Vec::new();
    for word in rest.split_whitespace() {
        if let Some(value) = word.strip_prefix("model=") {
            if value.is_empty() {
                return usage("usage: /new-agent <name> [model=<provider/id>]");
            }
            model = Some(value.to_string());
        } else {
            name_words.push(word);
        }
    }

    let name = match name_words.as_slice() {
        [single] => single.strip_prefix("name=").unwrap_or(single),
        ["name", "is", value] => value,
        _ => return usage("usage: /new-agent <name> [model=<provider/id>]"),
    };
    if name.is_empty() {
        return usage("usage: /new-agent <name> [model=<provider/id>]");
    }
    CommandMatch::NewAgent {
        name: name.trim_start_matches('@').to_string(),
        model,
    }
}

/// `/discuss @a,@b [maxRounds=N] <topic>`.
fn parse_discuss(rest: &str) -> CommandMatch {
    let mut parts = rest.splitn(2, char::is_whitespace);
    let agent_ids = parse_agent_list(parts.next().unwrap_or(""));
    let mut remainder = parts.next().map(str::trim).unwrap_or("").to_string();

    let mut max_rounds = None;
    if let Some(value) = remainder
        .split_whitespace()
        .next()
        .and_then(|w| w.strip_prefix("maxRounds="))
    {
        let Ok(rounds) = value.parse::<u32>() else {
            return usage("usage: /discuss @a,@b [maxRounds=N] <topic>");
        };
        max_rounds = Some(rounds);
        remainder = remainder
            .split_once(char::is_whitespace)
            .map(|(_, rest)| rest.trim().to_string())
            .unwrap_or_default();
    }

    if agent_ids.len() < 2 || remainder.is_empty() {
        usage("usage: /discuss @a,@b [maxRounds=N] <topic>")
    } else {
        CommandMatch::Discuss {
            agent_ids,
            max_rounds,
            topic: remainder,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_none() {
        assert_eq!(route_command("hello there"), CommandMatch::None);
        assert_eq!(route_command(""), CommandMatch::None);
    }

    #[test]
    fn mention_routes_to_agent() {
        assert_eq!(
            route_command("@Jack, review this PR"),
            CommandMatch::RouteAgent {
                agent_id: "jack".to_string(),
                task: "review this PR".to_string(),
            }
        );
    }

    #[test]
    fn mention_with_colon_and_dots() {
        assert_eq!(
            route_command("@code.review: check main.rs"),
            CommandMatch::RouteAgent {
                agent_id: "codereview".to_string(),
                task: "check main.rs".to_string(),
            }
        );
    }

    #[test]
    fn mention_task_can_span_lines() {
        let matched = route_command("@jack do this:\nline two");
        assert!(matches!(
            matched,
            CommandMatch::RouteAgent { task, .. } if task.contains("line two")
        ));
    }

    #[test]
    fn bare_mention_is_an_error() {
        assert!(matches!(route_command("@jack"), CommandMatch::Error { .. }));
        assert!(matches!(route_command("@ hello"), CommandMatch::Error { .. }));
    }

    #[test]
    fn agents_list() {
        assert_eq!(route_command("/agents"), CommandMatch::ListAgents);
    }

    #[test]
    fn new_agent_forms() {
        let expected = CommandMatch::NewAgent {
            name: "jack".to_string(),
            model: None,
        };
        assert_eq!(route_command("/new-agent jack"), expected);
        assert_eq!(route_command("/new-agent name=jack"), expected);
        assert_eq!(route_command("/new-agent name is jack"), expected);
    }

    #[test]
    fn new_agent_with_model() {
        assert_eq!(
            route_command("/new-agent jack model=anthropic/claude"),
            CommandMatch::NewAgent {
                name: "jack".to_string(),
                model: Some("anthropic/claude".to_string()),
            }
        );
    }

    #[test]
    fn new_agent_malformed() {
        assert!(matches!(route_command("/new-agent"), CommandMatch::Error { .. }));
        assert!(matches!(
            route_command("/new-agent too many words"),
            CommandMatch::Error { .. }
        ));
        assert!(matches!(
            route_command("/new-agent jack model="),
            CommandMatch::Error { .. }
        ));
    }

    #[test]
    fn del_agent() {
        assert_eq!(
            route_command("/del-agent @jack"),
            CommandMatch::DeleteAgent {
                name: "jack".to_string(),
            }
        );
        assert!(matches!(route_command("/del-agent"), CommandMatch::Error { .. }));
    }

    #[test]
    fn focus() {
        assert_eq!(
            route_command("/focus @jack"),
            CommandMatch::Focus {
                name: "jack".to_string(),
            }
        );
        assert!(matches!(route_command("/focus"), CommandMatch::Error { .. }));
        assert!(matches!(
            route_command("/focus @a @b"),
            CommandMatch::Error { .. }
        ));
    }

    #[test]
    fn run_with_agent_list() {
        assert_eq!(
            route_command("/run @a,@b summarize the logs"),
            CommandMatch::Run {
                agent_ids: vec!["a".to_string(), "b".to_string()],
                task: "summarize the logs".to_string(),
            }
        );
    }

    #[test]
    fn run_malformed() {
        assert!(matches!(route_command("/run"), CommandMatch::Error { .. }));
        assert!(matches!(route_command("/run @a"), CommandMatch::Error { .. }));
    }

    #[test]
    fn discuss_with_max_rounds() {
        assert_eq!(
            route_command("/discuss @a,@b maxRounds=3 rollout plan"),
            CommandMatch::Discuss {
                agent_ids: vec!["a".to_string(), "b".to_string()],
                max_rounds: Some(3),
                topic: "rollout plan".to_string(),
            }
        );
    }

    #[test]
    fn discuss_without_max_rounds() {
        assert_eq!(
            route_command("/discuss @a,@b rollout plan"),
            CommandMatch::Discuss {
                agent_ids: vec!["a".to_string(), "b".to_string()],
                max_rounds: None,
                topic: "rollout plan".to_string(),
            }
        );
    }

    #[test]
    fn discuss_requires_two_agents_and_topic() {
        assert!(matches!(
            route_command("/discuss @a topic"),
            CommandMatch::Error { .. }
        ));
        assert!(matches!(
            route_command("/discuss @a,@b"),
            CommandMatch::Error { .. }
        ));
        assert!(matches!(
            route_command("/discuss @a,@b maxRounds=x topic"),
            CommandMatch::Error { .. }
        ));
    }

    #[test]
    fn unknown_command_is_error() {
        assert!(matches!(route_command("/frobnicate"), CommandMatch::Error { .. }));
    }

    #[test]
    fn acl_classification() {
        assert!(!route_command("/agents").requires_owner());
        assert!(!route_command("@jack do it").requires_owner());
        assert!(route_command("/new-agent jack").requires_owner());
        assert!(route_command("/run @a,@b x").requires_owner());
    }
}
