//! Command parsing for the interactive client.
//!
//! Turns lines typed at the `shard-master client` prompt into structured
//! commands. Meta-commands (HELP, EXIT) never reach the cluster.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};

use crate::command::{GroupId, ShardId};

pub const USAGE: &str = "commands: JOIN/j <gid>=<addr>[,<addr>...] ..., LEAVE/l <gid> ..., \
MOVE/m <shard> <gid>, QUERY/q [version], HELP/h, EXIT/e";

/// Commands that can be entered at the client prompt.
#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Join {
        groups: BTreeMap<GroupId, Vec<String>>,
    },
    Leave {
        group_ids: Vec<GroupId>,
    },
    Move {
        shard: ShardId,
        group: GroupId,
    },
    Query {
        version: i64,
    },
    Help,
    Exit,
}

impl ConsoleCommand {
    /// Parses a line of user input into a command.
    ///
    /// Commands are case-insensitive and accept single-letter aliases.
    /// `QUERY` without a version asks for the latest configuration.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let cmd = first.to_uppercase();
        let normalized_cmd = match cmd.as_str() {
            "J" => "JOIN",
            "L" => "LEAVE",
            "M" => "MOVE",
            "Q" => "QUERY",
            "H" => "HELP",
            "E" => "EXIT",
            other => other,
        };
        let args = &parts[1..];

        match (normalized_cmd, args.len()) {
            ("EXIT", 0) => Ok(ConsoleCommand::Exit),
            ("HELP", 0) => Ok(ConsoleCommand::Help),
            ("QUERY", 0) => Ok(ConsoleCommand::Query { version: -1 }),
            ("QUERY", 1) => Ok(ConsoleCommand::Query {
                version: args[0]
                    .parse()
                    .with_context(|| format!("invalid version '{}'", args[0]))?,
            }),
            ("MOVE", 2) => Ok(ConsoleCommand::Move {
                shard: args[0]
                    .parse()
                    .with_context(|| format!("invalid shard '{}'", args[0]))?,
                group: parse_gid(args[1])?,
            }),
            ("LEAVE", n) if n > 0 => Ok(ConsoleCommand::Leave {
                group_ids: args.iter().map(|arg| parse_gid(arg)).collect::<Result<_>>()?,
            }),
            ("JOIN", n) if n > 0 => Ok(ConsoleCommand::Join {
                groups: parse_groups(args)?,
            }),
            ("QUERY", _) => Err(anyhow!("QUERY takes at most one argument: QUERY [version]")),
            ("MOVE", _) => Err(anyhow!("MOVE requires exactly two arguments: MOVE <shard> <gid>")),
            ("LEAVE", _) => Err(anyhow!("LEAVE requires at least one group id")),
            ("JOIN", _) => Err(anyhow!("JOIN requires at least one <gid>=<addr> entry")),
            _ => Err(anyhow!("invalid command. {USAGE}")),
        }
    }
}

fn parse_gid(arg: &str) -> Result<GroupId> {
    arg.parse()
        .with_context(|| format!("invalid group id '{arg}'"))
}

fn parse_groups(args: &[&str]) -> Result<BTreeMap<GroupId, Vec<String>>> {
    let mut groups = BTreeMap::new();
    for arg in args {
        let Some((gid, servers)) = arg.split_once('=') else {
            return Err(anyhow!("invalid group entry '{arg}', expected <gid>=<addr>[,<addr>...]"));
        };
        let servers: Vec<String> = servers
            .split(',')
            .filter(|server| !server.is_empty())
            .map(str::to_string)
            .collect();
        if servers.is_empty() {
            return Err(anyhow!("group {gid} needs at least one server address"));
        }
        groups.insert(parse_gid(gid)?, servers);
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_commands() {
        assert!(matches!(ConsoleCommand::parse("exit"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("EXIT"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("HeLp"), Ok(ConsoleCommand::Help)));
        assert!(matches!(
            ConsoleCommand::parse("QuErY 3"),
            Ok(ConsoleCommand::Query { version: 3 })
        ));
    }

    #[test]
    fn test_aliases() {
        assert!(matches!(ConsoleCommand::parse("e"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("h"), Ok(ConsoleCommand::Help)));
        assert!(matches!(
            ConsoleCommand::parse("q"),
            Ok(ConsoleCommand::Query { version: -1 })
        ));
        assert!(matches!(
            ConsoleCommand::parse("m 3 101"),
            Ok(ConsoleCommand::Move { shard: 3, group: 101 })
        ));
        assert!(matches!(
            ConsoleCommand::parse("L 100 101"),
            Ok(ConsoleCommand::Leave { group_ids }) if group_ids == vec![100, 101]
        ));
    }

    #[test]
    fn test_join_groups() {
        let parsed = ConsoleCommand::parse("join 100=a:1,b:2 101=c:3").unwrap();
        let mut expected = BTreeMap::new();
        expected.insert(100, vec!["a:1".to_string(), "b:2".to_string()]);
        expected.insert(101, vec!["c:3".to_string()]);
        assert_eq!(parsed, ConsoleCommand::Join { groups: expected });
    }

    #[test]
    fn test_invalid_commands() {
        assert!(ConsoleCommand::parse("").is_err());
        assert!(ConsoleCommand::parse("   ").is_err());
        assert!(ConsoleCommand::parse("INVALID").is_err());
        assert!(ConsoleCommand::parse("JOIN").is_err());
        assert!(ConsoleCommand::parse("JOIN 100").is_err());
        assert!(ConsoleCommand::parse("JOIN 100=").is_err());
        assert!(ConsoleCommand::parse("JOIN x=a").is_err());
        assert!(ConsoleCommand::parse("LEAVE").is_err());
        assert!(ConsoleCommand::parse("LEAVE one").is_err());
        assert!(ConsoleCommand::parse("MOVE 1").is_err());
        assert!(ConsoleCommand::parse("MOVE -1 100").is_err());
        assert!(ConsoleCommand::parse("QUERY 1 2").is_err());
        assert!(ConsoleCommand::parse("EXIT now").is_err());
    }
}
