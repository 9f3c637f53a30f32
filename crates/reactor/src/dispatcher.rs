//! Declarative command-to-handler routing and the built-in commands every
//! service gets for free when it opts in.
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use regex::Regex;
use tracing::warn;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::time::unix_timestamp;

/// How a [`Dispatcher`] match entry decides whether it handles an incoming
/// command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    /// `command_pattern` is the literal command name.
    Exact,
    /// `command_pattern` is a regular expression, anchored at both ends.
    Regex,
    /// Matches any command. Valid only as the dispatcher's final entry.
    Always,
}

/// The type constraint a [`MessageDefinition`] places on one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// Any string is accepted.
    String,
    /// Must parse via [`Message::get_integer_parameter`].
    Integer,
    /// Must parse via [`Message::get_unsigned_parameter`].
    Unsigned,
    /// Must parse via [`Message::get_double_parameter`].
    Double,
    /// Must parse via [`Message::get_timestamp_parameter`].
    Timestamp,
}

#[derive(Debug, Clone)]
struct ParamSpec {
    name: String,
    required: bool,
    kind: ParamType,
}

/// Declares the required/optional parameters a match expects, with a type
/// constraint per parameter. Checked before the handler runs; a violation
/// short-circuits to an `INVALID` reply.
#[derive(Debug, Clone, Default)]
pub struct MessageDefinition {
    params: Vec<ParamSpec>,
}

impl MessageDefinition {
    /// An empty definition (nothing required, nothing type-checked).
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `name` as required, with the given type constraint.
    pub fn required(mut self, name: impl Into<String>, kind: ParamType) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            required: true,
            kind,
        });
        self
    }

    /// Declare `name` as optional, with the given type constraint applied
    /// only if present.
    pub fn optional(mut self, name: impl Into<String>, kind: ParamType) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            required: false,
            kind,
        });
        self
    }

    fn verify(&self, msg: &Message) -> std::result::Result<(), String> {
        for p in &self.params {
            let raw = msg.get_parameter(&p.name);
            match raw {
                None if p.required => {
                    return Err(format!("missing required parameter `{}`", p.name))
                }
                None => continue,
                Some(_) => {}
            }
            let well_typed = match p.kind {
                ParamType::String => true,
                ParamType::Integer => msg.get_integer_parameter(&p.name).is_ok(),
                ParamType::Unsigned => msg.get_unsigned_parameter(&p.name).is_ok(),
                ParamType::Double => msg.get_double_parameter(&p.name).is_ok(),
                ParamType::Timestamp => msg.get_timestamp_parameter(&p.name).is_ok(),
            };
            if !well_typed {
                return Err(format!(
                    "parameter `{}` does not match its declared type",
                    p.name
                ));
            }
        }
        Ok(())
    }
}

/// Sends a reply in whatever direction the incoming message came from.
/// Implemented once per connection kind (stream, datagram); a dispatch
/// never needs to know which.
pub trait Responder {
    /// Send `message` back to the sender of the message currently being
    /// dispatched.
    fn reply(&mut self, message: &Message) -> Result<()>;
}

/// A connection that can have a message handed to it for delivery, used by
/// [`broadcast`]. Implemented by the message-oriented connection kinds.
pub trait MessageSender {
    /// Queue or send `message`; see the implementor for its caching policy.
    fn send_message(&mut self, message: &Message, cache: bool) -> Result<bool>;
}

/// Send `message` to every connection in `targets`, returning `true` iff
/// every send succeeded.
pub fn broadcast(targets: &mut [&mut dyn MessageSender], message: &Message, cache: bool) -> bool {
    let mut all_ok = true;
    for target in targets.iter_mut() {
        match target.send_message(message, cache) {
            Ok(true) => {}
            Ok(false) => all_ok = false,
            Err(e) => {
                warn!(target: "dispatcher", "broadcast send failed: {e}");
                all_ok = false;
            }
        }
    }
    all_ok
}

/// Service-wide hooks fired by the built-in commands registered through
/// [`Dispatcher::add_communicator_commands`].
pub trait CommunicatorHooks {
    /// `READY` was received: the peer announces it is ready.
    fn ready(&mut self) {}
    /// `RESTART` was received: the peer asks us to restart.
    fn restart(&mut self) {}
    /// `STOP` (or `QUITTING`, with `quitting = true`) was received.
    fn stop(&mut self, quitting: bool) {}
    /// `LOG_ROTATE` was received: reopen log sinks.
    fn log_rotate(&mut self) {}
}

enum Pattern {
    Literal(String),
    Regex(Regex),
}

struct MatchEntry {
    pattern: Pattern,
    strategy: MatchStrategy,
    definition: Option<MessageDefinition>,
    handler: RefCell<Box<dyn FnMut(&Message, &mut dyn Responder) -> Result<()>>>,
}

impl MatchEntry {
    fn matches(&self, command: &str) -> bool {
        match (&self.strategy, &self.pattern) {
            (MatchStrategy::Always, _) => true,
            (MatchStrategy::Exact, Pattern::Literal(s)) => s == command,
            (MatchStrategy::Regex, Pattern::Regex(re)) => re.is_match(command),
            _ => false,
        }
    }
}

/// An ordered command-to-handler table, as supplied by one service.
///
/// Matches are tried in registration order; the first whose strategy
/// matches the incoming command's name runs. A message unmatched by any
/// entry gets a synthesized `UNKNOWN` reply (carrying the original
/// `command` as a parameter) unless the service registered its own
/// [`MatchStrategy::Always`] entry, which always wins that slot instead.
#[derive(Default)]
pub struct Dispatcher {
    matches: Vec<MatchEntry>,
    known_commands: Rc<RefCell<Vec<String>>>,
}

impl Dispatcher {
    /// An empty dispatcher with no registered matches.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. `pattern`'s meaning depends on `strategy`. Panics
    /// if a [`MatchStrategy::Always`] entry was already registered (it must
    /// be the final entry).
    pub fn add_match(
        &mut self,
        pattern: &str,
        strategy: MatchStrategy,
        handler: impl FnMut(&Message, &mut dyn Responder) -> Result<()> + 'static,
    ) -> &mut Self {
        assert!(
            !matches!(
                self.matches.last().map(|m| m.strategy),
                Some(MatchStrategy::Always)
            ),
            "an ALWAYS catch-all match must be the dispatcher's final entry"
        );

        let built = match strategy {
            MatchStrategy::Exact => {
                self.known_commands.borrow_mut().push(pattern.to_string());
                Pattern::Literal(pattern.to_string())
            }
            MatchStrategy::Regex => {
                let anchored = format!("^(?:{pattern})$");
                Pattern::Regex(Regex::new(&anchored).expect("invalid match regex"))
            }
            MatchStrategy::Always => Pattern::Literal(String::new()),
        };

        self.matches.push(MatchEntry {
            pattern: built,
            strategy,
            definition: None,
            handler: RefCell::new(Box::new(handler)),
        });
        self
    }

    /// Attach a [`MessageDefinition`] to the match just registered with
    /// [`Dispatcher::add_match`].
    pub fn with_definition(&mut self, definition: MessageDefinition) -> &mut Self {
        if let Some(last) = self.matches.last_mut() {
            last.definition = Some(definition);
        }
        self
    }

    /// Register the standard built-in commands (`HELP`, `ALIVE`,
    /// `LOG_ROTATE`, `QUITTING`, `READY`, `RESTART`, `STOP`, `UNKNOWN`),
    /// forwarding the lifecycle ones to `hooks`.
    pub fn add_communicator_commands(&mut self, hooks: Rc<RefCell<dyn CommunicatorHooks>>) -> &mut Self {
        let known = Rc::clone(&self.known_commands);
        self.add_match("HELP", MatchStrategy::Exact, move |_msg, responder| {
            let list = known.borrow().join(",");
            let mut reply = Message::new("COMMANDS")?;
            reply.set_parameter("list", list);
            responder.reply(&reply)
        });

        self.add_match("ALIVE", MatchStrategy::Exact, |msg, responder| {
            let mut reply = Message::new("ABSOLUTELY")?;
            reply.set_unsigned_parameter("timestamp", unix_timestamp());
            if let Some(serial) = msg.get_parameter("serial") {
                reply.set_parameter("serial", serial.to_string());
            }
            responder.reply(&reply)
        });

        let h = Rc::clone(&hooks);
        self.add_match("LOG_ROTATE", MatchStrategy::Exact, move |_msg, _responder| {
            h.borrow_mut().log_rotate();
            Ok(())
        });

        let h = Rc::clone(&hooks);
        self.add_match("QUITTING", MatchStrategy::Exact, move |_msg, _responder| {
            h.borrow_mut().stop(true);
            Ok(())
        });

        let h = Rc::clone(&hooks);
        self.add_match("READY", MatchStrategy::Exact, move |_msg, _responder| {
            h.borrow_mut().ready();
            Ok(())
        });

        let h = Rc::clone(&hooks);
        self.add_match("RESTART", MatchStrategy::Exact, move |_msg, _responder| {
            h.borrow_mut().restart();
            Ok(())
        });

        let h = Rc::clone(&hooks);
        self.add_match("STOP", MatchStrategy::Exact, move |_msg, _responder| {
            h.borrow_mut().stop(false);
            Ok(())
        });

        self.add_match("UNKNOWN", MatchStrategy::Exact, |msg, _responder| {
            warn!(
                target: "dispatcher",
                "peer did not understand our `{}` command",
                msg.get_parameter("command").unwrap_or("?")
            );
            Ok(())
        });

        self
    }

    /// Scan matches in order and run the first handler whose strategy
    /// matches `msg.command()`. Parameter definitions are checked first;
    /// a violation replies `INVALID` and skips the handler. A command
    /// matched by nothing gets a synthesized `UNKNOWN` reply.
    ///
    /// A handler's `Err` is logged and swallowed, except
    /// [`Error::Internal`], which is re-raised to fail fast.
    pub fn dispatch(&self, msg: &Message, responder: &mut dyn Responder) -> Result<()> {
        for entry in &self.matches {
            if !entry.matches(msg.command()) {
                continue;
            }

            if let Some(def) = &entry.definition {
                if let Err(reason) = def.verify(msg) {
                    let mut reply = Message::new("INVALID")?;
                    reply.set_parameter("command", msg.command());
                    reply.set_parameter("reason", reason);
                    return responder.reply(&reply);
                }
            }

            let mut handler = entry.handler.borrow_mut();
            return match (handler)(msg, responder) {
                Ok(()) => Ok(()),
                Err(e @ Error::Internal(_)) => Err(e),
                Err(e) => {
                    warn!(target: "dispatcher", "handler for `{}` failed: {e}", msg.command());
                    Ok(())
                }
            };
        }

        let mut reply = Message::new("UNKNOWN")?;
        reply.set_parameter("command", msg.command());
        responder.reply(&reply)
    }

    /// Check that no two literal-command matches declare conflicting type
    /// constraints for the same parameter name. Intended to be run once at
    /// service start-up, not on the hot dispatch path.
    pub fn verify_definitions(&self) -> Result<()> {
        let mut seen: HashMap<&str, HashMap<&str, ParamType>> = HashMap::new();
        for entry in &self.matches {
            let Pattern::Literal(command) = &entry.pattern else {
                continue;
            };
            let Some(def) = &entry.definition else {
                continue;
            };
            let by_param = seen.entry(command.as_str()).or_default();
            for p in &def.params {
                match by_param.get(p.name.as_str()) {
                    Some(existing) if *existing != p.kind => {
                        return Err(Error::Internal(format!(
                            "conflicting type constraints for parameter `{}` on command `{command}`",
                            p.name
                        )));
                    }
                    _ => {
                        by_param.insert(p.name.as_str(), p.kind);
                    }
                }
            }
        }
        Ok(())
    }
}
