//! Console grammar expressed as a static command table.
//!
//! The parser walks these nodes and `help` renders the same entries, so
//! keywords and usage text cannot drift apart.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandTag {
    Status,
    History,
    Stats,
    Relay,
    Coproc,
    Help,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubcommandTag {
    CoprocReconfigure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChoiceTag {
    HistoryAll,
    HistoryAge,
    HistorySince,
    RelayOn,
    RelayOff,
}

/// Value expected after a choice keyword.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueSpec {
    None,
    /// Unsuffixed decimal integer.
    Integer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub tag: CommandTag,
    pub grammar: &'static Node,
    pub usage: &'static str,
    pub summary: &'static str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Node {
    End,
    OptionalChoice {
        choices: &'static [ChoiceBranch],
        default: Option<ChoiceTag>,
    },
    Subcommands(&'static [SubcommandBranch]),
    Topic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChoiceBranch {
    pub keyword: &'static str,
    pub tag: ChoiceTag,
    pub value: ValueSpec,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubcommandBranch {
    pub name: &'static str,
    pub tag: SubcommandTag,
    pub grammar: &'static Node,
}

const END: Node = Node::End;

const HISTORY_CHOICES: [ChoiceBranch; 2] = [
    ChoiceBranch {
        keyword: "age",
        tag: ChoiceTag::HistoryAge,
        value: ValueSpec::Integer,
    },
    ChoiceBranch {
        keyword: "since",
        tag: ChoiceTag::HistorySince,
        value: ValueSpec::Integer,
    },
];

const HISTORY_GRAMMAR: Node = Node::OptionalChoice {
    choices: &HISTORY_CHOICES,
    default: Some(ChoiceTag::HistoryAll),
};

const RELAY_CHOICES: [ChoiceBranch; 2] = [
    ChoiceBranch {
        keyword: "on",
        tag: ChoiceTag::RelayOn,
        value: ValueSpec::None,
    },
    ChoiceBranch {
        keyword: "off",
        tag: ChoiceTag::RelayOff,
        value: ValueSpec::None,
    },
];

const RELAY_GRAMMAR: Node = Node::OptionalChoice {
    choices: &RELAY_CHOICES,
    default: None,
};

const COPROC_SUBCOMMANDS: [SubcommandBranch; 1] = [SubcommandBranch {
    name: "reconfigure",
    tag: SubcommandTag::CoprocReconfigure,
    grammar: &END,
}];

const COPROC_GRAMMAR: Node = Node::Subcommands(&COPROC_SUBCOMMANDS);

const HELP_GRAMMAR: Node = Node::Topic;

const COMMANDS: [CommandSpec; 6] = [
    CommandSpec {
        name: "status",
        tag: CommandTag::Status,
        grammar: &END,
        usage: "status",
        summary: "relaying flags, sink outcomes, coprocessor link and store occupancy",
    },
    CommandSpec {
        name: "history",
        tag: CommandTag::History,
        grammar: &HISTORY_GRAMMAR,
        usage: "history [age <seconds> | since <sequence>]",
        summary: "stored advertisements, newest first",
    },
    CommandSpec {
        name: "stats",
        tag: CommandTag::Stats,
        grammar: &END,
        usage: "stats",
        summary: "gateway counters",
    },
    CommandSpec {
        name: "relay",
        tag: CommandTag::Relay,
        grammar: &RELAY_GRAMMAR,
        usage: "relay on|off",
        summary: "enable or disable relaying to every sink",
    },
    CommandSpec {
        name: "coproc",
        tag: CommandTag::Coproc,
        grammar: &COPROC_GRAMMAR,
        usage: "coproc reconfigure",
        summary: "push the scan configuration to the radio coprocessor again",
    },
    CommandSpec {
        name: "help",
        tag: CommandTag::Help,
        grammar: &HELP_GRAMMAR,
        usage: "help [command]",
        summary: "list commands or show one command's usage",
    },
];

/// Returns the full command catalog.
#[must_use]
pub const fn commands() -> &'static [CommandSpec] {
    &COMMANDS
}

/// Finds a command by name (case insensitive).
#[must_use]
pub fn find(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS
        .iter()
        .find(|command| command.name.eq_ignore_ascii_case(name))
}
