// src/core/conf.rs

//! The configuration surface: the command table modules expose, the parse
//! context handed to their handlers, and the directive-text parser that
//! drives them (`name arg1 arg2;`, `name { ... }` blocks, `#` comments).
//!
//! The parser populates the cycle's per-module configuration table by
//! dispatching each directive to the owning module's `set` handler. An
//! embedder with its own configuration source can bypass `parse_file` and
//! drive the same dispatch entry points directly.

use std::any::Any;
use std::path::Path;
use std::rc::Rc;

use crate::core::cycle::Cycle;
use crate::core::errors::PeridotError;
use crate::core::pool::Pool;

/// Handler invoked when the parser hits a directive owned by a module's
/// command table. Returns a bare message; the parser attaches file and line.
pub type SetFn =
    fn(&mut ConfContext<'_>, &Command, &[String], Option<&mut dyn Any>) -> Result<(), String>;

pub struct Command {
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    /// Block directives take a `{ ... }` body after their arguments.
    pub block: bool,
    pub set: SetFn,
}

impl Command {
    pub const fn takes1(name: &'static str, set: SetFn) -> Command {
        Command {
            name,
            min_args: 1,
            max_args: 1,
            block: false,
            set,
        }
    }

    pub const fn takes_range(
        name: &'static str,
        min_args: usize,
        max_args: usize,
        set: SetFn,
    ) -> Command {
        Command {
            name,
            min_args,
            max_args,
            block: false,
            set,
        }
    }

    pub const fn block(name: &'static str, set: SetFn) -> Command {
        Command {
            name,
            min_args: 0,
            max_args: 1,
            block: true,
            set,
        }
    }
}

/// Scratch state threaded through the parse: the cycle under construction, a
/// temporary pool destroyed when the build finishes, and the position used
/// for error reporting.
pub struct ConfContext<'a> {
    pub cycle: &'a mut Cycle,
    pub temp_pool: Rc<Pool>,
    pub file: String,
    pub line: usize,
}

impl<'a> ConfContext<'a> {
    pub fn new(
        cycle: &'a mut Cycle,
        temp_pool: Rc<Pool>,
        file: impl Into<String>,
    ) -> ConfContext<'a> {
        ConfContext {
            cycle,
            temp_pool,
            file: file.into(),
            line: 1,
        }
    }

    /// Builds a positioned configuration error.
    pub fn error(&self, message: impl Into<String>) -> PeridotError {
        PeridotError::Config {
            file: self.file.clone(),
            line: self.line,
            message: message.into(),
        }
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Semi,
    Open,
    Close,
}

struct Positioned {
    token: Token,
    line: usize,
}

fn tokenize(text: &str, file: &str) -> Result<Vec<Positioned>, PeridotError> {
    let mut out = Vec::new();
    let mut line = 1usize;
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            ';' => {
                chars.next();
                out.push(Positioned {
                    token: Token::Semi,
                    line,
                });
            }
            '{' => {
                chars.next();
                out.push(Positioned {
                    token: Token::Open,
                    line,
                });
            }
            '}' => {
                chars.next();
                out.push(Positioned {
                    token: Token::Close,
                    line,
                });
            }
            quote @ ('"' | '\'') => {
                chars.next();
                let start = line;
                let mut word = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some('\\') => {
                            if let Some(escaped) = chars.next() {
                                word.push(escaped);
                            }
                        }
                        Some('\n') => {
                            line += 1;
                            word.push('\n');
                        }
                        Some(c) => word.push(c),
                        None => {
                            return Err(PeridotError::Config {
                                file: file.to_owned(),
                                line: start,
                                message: "unterminated quoted string".into(),
                            });
                        }
                    }
                }
                out.push(Positioned {
                    token: Token::Word(word),
                    line,
                });
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, ';' | '{' | '}' | '#') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                out.push(Positioned {
                    token: Token::Word(word),
                    line,
                });
            }
        }
    }

    Ok(out)
}

/// Parses a configuration file against the context's cycle.
pub fn parse_file(ctx: &mut ConfContext<'_>, path: &Path) -> Result<(), PeridotError> {
    let text = std::fs::read_to_string(path).map_err(|e| PeridotError::io(path, e))?;
    let saved = std::mem::replace(&mut ctx.file, path.display().to_string());
    let result = parse_text(ctx, &text);
    ctx.file = saved;
    result
}

/// Parses directive text that did not come from a file (`-g` parameters).
pub fn parse_snippet(
    ctx: &mut ConfContext<'_>,
    text: &str,
    origin: &str,
) -> Result<(), PeridotError> {
    let saved = std::mem::replace(&mut ctx.file, origin.to_owned());
    let result = parse_text(ctx, text);
    ctx.file = saved;
    result
}

fn parse_text(ctx: &mut ConfContext<'_>, text: &str) -> Result<(), PeridotError> {
    let tokens = tokenize(text, &ctx.file)?;
    let mut pos = 0;
    parse_level(ctx, &tokens, &mut pos, false)
}

fn parse_level(
    ctx: &mut ConfContext<'_>,
    tokens: &[Positioned],
    pos: &mut usize,
    in_block: bool,
) -> Result<(), PeridotError> {
    let mut words: Vec<String> = Vec::new();

    while *pos < tokens.len() {
        let item = &tokens[*pos];
        ctx.line = item.line;
        *pos += 1;

        match &item.token {
            Token::Word(w) => words.push(w.clone()),
            Token::Semi => {
                if words.is_empty() {
                    return Err(ctx.error("unexpected \";\""));
                }
                dispatch(ctx, &words, false)?;
                words.clear();
            }
            Token::Open => {
                if words.is_empty() {
                    return Err(ctx.error("unexpected \"{\""));
                }
                dispatch(ctx, &words, true)?;
                words.clear();
                parse_level(ctx, tokens, pos, true)?;
            }
            Token::Close => {
                if !words.is_empty() {
                    return Err(ctx.error("unexpected \"}\""));
                }
                if !in_block {
                    return Err(ctx.error("unexpected \"}\""));
                }
                return Ok(());
            }
        }
    }

    if !words.is_empty() {
        return Err(ctx.error("unexpected end of file, expecting \";\" or \"{\""));
    }
    if in_block {
        return Err(ctx.error("unexpected end of file, expecting \"}\""));
    }
    Ok(())
}

fn dispatch(ctx: &mut ConfContext<'_>, words: &[String], block: bool) -> Result<(), PeridotError> {
    let name = words[0].as_str();
    let args = &words[1..];
    let modules = ctx.cycle.modules.clone();

    for slot in modules.iter() {
        for cmd in slot.module.commands() {
            if cmd.name != name {
                continue;
            }

            if block != cmd.block {
                let expected = if cmd.block { "a block" } else { "\";\"" };
                return Err(ctx.error(format!(
                    "directive \"{name}\" expects {expected}"
                )));
            }

            if args.len() < cmd.min_args || args.len() > cmd.max_args {
                return Err(ctx.error(format!(
                    "invalid number of arguments in \"{name}\" directive"
                )));
            }

            // lift the destination out of the table so the handler can hold
            // the conf and the context at the same time
            let mut conf = ctx.cycle.conf_table_take(slot.index);
            let result = (cmd.set)(ctx, cmd, args, conf.as_deref_mut());
            ctx.cycle.conf_table_put(slot.index, conf);

            return result.map_err(|message| ctx.error(message));
        }
    }

    Err(ctx.error(format!("unknown directive \"{name}\"")))
}
