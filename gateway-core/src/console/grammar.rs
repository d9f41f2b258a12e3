#![allow(clippy::module_name_repetitions)]

//! Lexer and parser for the diagnostics console.
//!
//! The lexer uses `regal` to produce a bounded token stream; `winnow`
//! combinators match tokens against the static [`catalog`](super::catalog)
//! to build a [`Command`].

use core::fmt;
use core::ops::Range;

use heapless::Vec as HeaplessVec;
use regal::IncrementalError;
use regal::TokenCache;
use regal_macros::RegalLexer;
use winnow::combinator::opt;
use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::token::any;

use crate::adv_table::HistoryFilter;

use super::catalog::{self, ChoiceBranch, ChoiceTag, CommandTag, Node, SubcommandTag, ValueSpec};

/// Maximum number of tokens produced per console line.
pub const MAX_TOKENS: usize = 16;
const MAX_CACHE_RECORDS: usize = MAX_TOKENS * 2;

/// Lexical token kinds recognized by the console grammar.
#[derive(RegalLexer, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TokenKind {
    #[regex(r"[0-9]+")]
    Integer,
    /// Identifier or keyword (case-insensitive match performed later).
    #[regex(r"[A-Za-z][A-Za-z0-9-]*")]
    Ident,
    #[regex(r"[ \t]+", skip)]
    Whitespace,
    /// End-of-line token (`\r`, `\n`, or `\r\n`).
    #[token("\r\n")]
    #[token("\n")]
    #[token("\r")]
    Eol,
    /// Pseudo variant used when the lexer encounters unsupported input.
    #[default]
    #[regex(r".", priority = 1024)]
    Error,
}

/// Token emitted by the lexer with a byte span back into the source line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub lexeme: &'a str,
    pub span: Range<usize>,
}

/// Bounded token buffer.
pub type TokenBuffer<'a> = HeaplessVec<Token<'a>, MAX_TOKENS>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LexError {
    /// Input produced more tokens than the static buffer allows.
    TooManyTokens { processed: usize },
    /// Underlying lexer reported an unrecoverable error.
    Engine,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexError::TooManyTokens { processed } => {
                write!(f, "token buffer exhausted after {processed} items")
            }
            LexError::Engine => write!(f, "lexer engine error"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrammarErrorKind<'a> {
    UnknownCommand {
        lexeme: &'a str,
        span: Range<usize>,
    },
    UnexpectedToken {
        expected: &'static str,
        found: TokenKind,
        span: Range<usize>,
    },
    UnexpectedEnd {
        expected: &'static str,
    },
    InvalidInteger {
        span: Range<usize>,
    },
    InvalidToken {
        span: Range<usize>,
        lexeme: &'a str,
    },
}

impl fmt::Display for GrammarErrorKind<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrammarErrorKind::UnknownCommand { lexeme, .. } => {
                write!(f, "unknown command `{lexeme}`, try `help`")
            }
            GrammarErrorKind::UnexpectedToken {
                expected,
                found,
                span,
            } => write!(f, "expected {expected}, found {found:?} at {span:?}"),
            GrammarErrorKind::UnexpectedEnd { expected } => {
                write!(f, "unexpected end of input, expected {expected}")
            }
            GrammarErrorKind::InvalidInteger { span } => {
                write!(f, "integer out of range at {span:?}")
            }
            GrammarErrorKind::InvalidToken { span, lexeme } => {
                write!(f, "unsupported token `{lexeme}` at {span:?}")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrammarError<'a> {
    pub kind: GrammarErrorKind<'a>,
}

impl fmt::Display for GrammarError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl<'a> GrammarError<'a> {
    fn unexpected(expected: &'static str, token: Option<&Token<'a>>) -> Self {
        let kind = match token {
            Some(tok) if tok.kind == TokenKind::Integer && expected == INTEGER => {
                GrammarErrorKind::InvalidInteger {
                    span: tok.span.clone(),
                }
            }
            Some(tok) if tok.kind != TokenKind::Eol => GrammarErrorKind::UnexpectedToken {
                expected,
                found: tok.kind,
                span: tok.span.clone(),
            },
            _ => GrammarErrorKind::UnexpectedEnd { expected },
        };
        GrammarError { kind }
    }

    fn unknown_command(token: &Token<'a>) -> Self {
        GrammarError {
            kind: GrammarErrorKind::UnknownCommand {
                lexeme: token.lexeme,
                span: token.span.clone(),
            },
        }
    }

    fn invalid_token(token: &Token<'a>) -> Self {
        GrammarError {
            kind: GrammarErrorKind::InvalidToken {
                span: token.span.clone(),
                lexeme: token.lexeme,
            },
        }
    }
}

/// Combined lex/parse error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseError<'a> {
    Lex(LexError),
    Grammar(GrammarError<'a>),
}

impl fmt::Display for ParseError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Lex(err) => err.fmt(f),
            ParseError::Grammar(err) => err.fmt(f),
        }
    }
}

/// Structured commands produced by the parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Status,
    History(HistoryFilter),
    Stats,
    Relay(bool),
    Coproc(CoprocCommand),
    Help(HelpCommand<'a>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoprocCommand {
    Reconfigure,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HelpCommand<'a> {
    pub topic: Option<&'a str>,
}

/// Tokenize the provided line.
pub fn lex(line: &str) -> Result<TokenBuffer<'_>, LexError> {
    let compiled = TokenKind::lexer();
    let mut cache: TokenCache<TokenKind, MAX_CACHE_RECORDS> = TokenCache::new();
    let partial = cache
        .rebuild(compiled, line)
        .map_err(map_incremental_error)?;
    let mut buffer = TokenBuffer::new();

    for record in cache.tokens() {
        if record.skipped {
            continue;
        }
        let span = record.start..record.end;
        let lexeme = &line[span.clone()];
        push_token(&mut buffer, record.token, lexeme, span)?;
    }

    if let Some(partial) = partial.filter(|partial| !partial.fragment.is_empty()) {
        let span = partial.start..partial.start + partial.fragment.len();
        push_token(&mut buffer, TokenKind::Error, partial.fragment, span)?;
    }

    Ok(buffer)
}

fn push_token<'a>(
    buffer: &mut TokenBuffer<'a>,
    kind: TokenKind,
    lexeme: &'a str,
    span: Range<usize>,
) -> Result<(), LexError> {
    buffer
        .push(Token { kind, lexeme, span })
        .map_err(|_| LexError::TooManyTokens {
            processed: buffer.len() + 1,
        })
}

fn map_incremental_error(error: IncrementalError) -> LexError {
    match error {
        IncrementalError::TokenOverflow => LexError::TooManyTokens {
            processed: MAX_TOKENS,
        },
        _ => LexError::Engine,
    }
}

/// Parse a console command from the provided line.
pub fn parse(line: &str) -> Result<Command<'_>, ParseError<'_>> {
    let tokens = lex(line).map_err(ParseError::Lex)?;

    if let Some(token) = tokens.iter().find(|token| token.kind == TokenKind::Error) {
        return Err(ParseError::Grammar(GrammarError::invalid_token(token)));
    }

    let mut input = tokens.as_slice();
    let command = command(&mut input).map_err(ParseError::Grammar)?;

    match input.iter().find(|token| token.kind != TokenKind::Eol) {
        Some(token) => Err(ParseError::Grammar(GrammarError::unexpected(
            "end of command",
            Some(token),
        ))),
        None => Ok(command),
    }
}

type Input<'src, 'slice> = &'slice [Token<'src>];

type TokenResult<O> = Result<O, ErrMode<ContextError>>;

const INTEGER: &str = "integer";

/// Runs `parser`, reporting `expected` against the token it stopped at.
fn expect<'src, 'slice, O>(
    input: &mut Input<'src, 'slice>,
    expected: &'static str,
    mut parser: impl Parser<Input<'src, 'slice>, O, ErrMode<ContextError>>,
) -> Result<O, GrammarError<'src>>
where
    'src: 'slice,
{
    parser
        .parse_next(input)
        .map_err(|_| GrammarError::unexpected(expected, input.first()))
}

fn token_of<'src, 'slice>(
    kind: TokenKind,
) -> impl Parser<Input<'src, 'slice>, Token<'src>, ErrMode<ContextError>>
where
    'src: 'slice,
{
    any.verify(move |token: &Token<'src>| token.kind == kind)
}

fn choice<'src, 'slice>(
    choices: &'static [ChoiceBranch],
) -> impl Parser<Input<'src, 'slice>, &'static ChoiceBranch, ErrMode<ContextError>>
where
    'src: 'slice,
{
    token_of(TokenKind::Ident).verify_map(move |token: Token<'src>| {
        choices
            .iter()
            .find(|choice| choice.keyword.eq_ignore_ascii_case(token.lexeme))
    })
}

fn integer<'src, 'slice>(input: &mut Input<'src, 'slice>) -> TokenResult<u64>
where
    'src: 'slice,
{
    token_of(TokenKind::Integer)
        .verify_map(|token: Token<'src>| token.lexeme.parse::<u64>().ok())
        .parse_next(input)
}

fn command<'src, 'slice>(input: &mut Input<'src, 'slice>) -> Result<Command<'src>, GrammarError<'src>>
where
    'src: 'slice,
{
    let head = expect(input, "command keyword", token_of(TokenKind::Ident))?;
    let spec = catalog::find(head.lexeme).ok_or_else(|| GrammarError::unknown_command(&head))?;
    let mut state = CommandState::new(spec.tag);
    parse_node(spec.grammar, input, &mut state)?;
    state.finish()
}

fn parse_node<'src, 'slice>(
    node: &'static Node,
    input: &mut Input<'src, 'slice>,
    state: &mut CommandState<'src>,
) -> Result<(), GrammarError<'src>>
where
    'src: 'slice,
{
    match *node {
        Node::End => Ok(()),
        Node::OptionalChoice { choices, default } => {
            let label = choices.first().map_or("keyword", |choice| choice.keyword);
            match expect(input, label, opt(choice(choices)))? {
                Some(branch) => {
                    let value = match branch.value {
                        ValueSpec::None => None,
                        ValueSpec::Integer => Some(expect(input, INTEGER, integer)?),
                    };
                    state.apply_choice(branch.tag, value);
                }
                None => {
                    if let Some(tag) = default {
                        state.apply_choice(tag, None);
                    }
                }
            }
            Ok(())
        }
        Node::Subcommands(branches) => {
            let label = branches.first().map_or("subcommand", |branch| branch.name);
            let branch = expect(
                input,
                label,
                token_of(TokenKind::Ident).verify_map(|token: Token<'src>| {
                    branches
                        .iter()
                        .find(|branch| branch.name.eq_ignore_ascii_case(token.lexeme))
                }),
            )?;
            state.set_subcommand(branch.tag);
            parse_node(branch.grammar, input, state)
        }
        Node::Topic => {
            let topic = expect(input, "topic", opt(token_of(TokenKind::Ident)))?;
            state.set_topic(topic.map(|token| token.lexeme));
            Ok(())
        }
    }
}

enum CommandState<'a> {
    Status,
    History { filter: Option<HistoryFilter> },
    Stats,
    Relay { enabled: Option<bool> },
    Coproc { subcommand: Option<SubcommandTag> },
    Help { topic: Option<&'a str> },
}

impl<'a> CommandState<'a> {
    fn new(tag: CommandTag) -> Self {
        match tag {
            CommandTag::Status => CommandState::Status,
            CommandTag::History => CommandState::History { filter: None },
            CommandTag::Stats => CommandState::Stats,
            CommandTag::Relay => CommandState::Relay { enabled: None },
            CommandTag::Coproc => CommandState::Coproc { subcommand: None },
            CommandTag::Help => CommandState::Help { topic: None },
        }
    }

    fn apply_choice(&mut self, tag: ChoiceTag, value: Option<u64>) {
        match (self, tag) {
            (CommandState::History { filter }, ChoiceTag::HistoryAll) => {
                *filter = Some(HistoryFilter::All);
            }
            (CommandState::History { filter }, ChoiceTag::HistoryAge) => {
                *filter = value.map(HistoryFilter::MaxAge);
            }
            (CommandState::History { filter }, ChoiceTag::HistorySince) => {
                *filter = value.map(HistoryFilter::SinceSequence);
            }
            (CommandState::Relay { enabled }, ChoiceTag::RelayOn) => *enabled = Some(true),
            (CommandState::Relay { enabled }, ChoiceTag::RelayOff) => *enabled = Some(false),
            _ => {}
        }
    }

    fn set_subcommand(&mut self, tag: SubcommandTag) {
        if let CommandState::Coproc { subcommand } = self {
            *subcommand = Some(tag);
        }
    }

    fn set_topic(&mut self, topic: Option<&'a str>) {
        if let CommandState::Help { topic: slot } = self {
            *slot = topic;
        }
    }

    fn finish(self) -> Result<Command<'a>, GrammarError<'a>> {
        match self {
            CommandState::Status => Ok(Command::Status),
            CommandState::History { filter } => {
                Ok(Command::History(filter.unwrap_or(HistoryFilter::All)))
            }
            CommandState::Stats => Ok(Command::Stats),
            CommandState::Relay {
                enabled: Some(enabled),
            } => Ok(Command::Relay(enabled)),
            CommandState::Relay { enabled: None } => Err(GrammarError::unexpected("on", None)),
            CommandState::Coproc {
                subcommand: Some(SubcommandTag::CoprocReconfigure),
            } => Ok(Command::Coproc(CoprocCommand::Reconfigure)),
            CommandState::Coproc { subcommand: None } => {
                Err(GrammarError::unexpected("reconfigure", None))
            }
            CommandState::Help { topic } => Ok(Command::Help(HelpCommand { topic })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(input: &str) -> Command<'_> {
        parse(input).expect("command should parse")
    }

    fn grammar_error(input: &str) -> GrammarErrorKind<'_> {
        match parse(input) {
            Err(ParseError::Grammar(err)) => err.kind,
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn parses_bare_commands() {
        assert_eq!(parse_ok("status"), Command::Status);
        assert_eq!(parse_ok("stats\r\n"), Command::Stats);
        assert_eq!(parse_ok("history"), Command::History(HistoryFilter::All));
    }

    #[test]
    fn parses_history_filters() {
        assert_eq!(
            parse_ok("history age 30"),
            Command::History(HistoryFilter::MaxAge(30))
        );
        assert_eq!(
            parse_ok("history since 1700000000"),
            Command::History(HistoryFilter::SinceSequence(1_700_000_000))
        );
    }

    #[test]
    fn history_filter_requires_a_number() {
        assert_eq!(
            grammar_error("history age"),
            GrammarErrorKind::UnexpectedEnd { expected: INTEGER }
        );
        assert!(matches!(
            grammar_error("history age 99999999999999999999999"),
            GrammarErrorKind::InvalidInteger { .. }
        ));
    }

    #[test]
    fn parses_relay_switch() {
        assert_eq!(parse_ok("relay on"), Command::Relay(true));
        assert_eq!(parse_ok("RELAY Off"), Command::Relay(false));
        assert_eq!(
            grammar_error("relay"),
            GrammarErrorKind::UnexpectedEnd { expected: "on" }
        );
    }

    #[test]
    fn parses_coproc_reconfigure() {
        assert_eq!(
            parse_ok("coproc reconfigure"),
            Command::Coproc(CoprocCommand::Reconfigure)
        );
        assert_eq!(
            grammar_error("coproc"),
            GrammarErrorKind::UnexpectedEnd {
                expected: "reconfigure"
            }
        );
    }

    #[test]
    fn parses_help_topic() {
        assert_eq!(
            parse_ok("help history"),
            Command::Help(HelpCommand {
                topic: Some("history"),
            })
        );
        assert_eq!(parse_ok("help"), Command::Help(HelpCommand { topic: None }));
    }

    #[test]
    fn rejects_unknown_command_and_trailing_tokens() {
        assert!(matches!(
            grammar_error("reboot now"),
            GrammarErrorKind::UnknownCommand { lexeme: "reboot", .. }
        ));
        assert!(matches!(
            grammar_error("status now"),
            GrammarErrorKind::UnexpectedToken {
                expected: "end of command",
                found: TokenKind::Ident,
                ..
            }
        ));
    }

    #[test]
    fn rejects_invalid_token() {
        assert!(matches!(
            grammar_error("relay on$"),
            GrammarErrorKind::InvalidToken { lexeme: "$", .. }
        ));
    }
}
