//! Key expressions used by the bridge.
//!
//! ```text
//! <prefix>/<unit>/<sensor>            sensor events
//! <prefix>/<verb>/@/cmd               requests addressed to a verb
//! <prefix>/<verb>/@/reply             replies to those requests
//! <prefix>/@/cmd, <prefix>/@/reply    global verbs (ping, info)
//! <prefix>/@/status                   bridge status
//! ```
//!
//! A verb is `<unit prefix>/<sensor uid>` or `<unit prefix>/admin`.

/// Default key expression prefix.
pub const KEY_PREFIX: &str = "mbsense";

const COMMAND: &str = "@/cmd";
const REPLY: &str = "@/reply";
const STATUS: &str = "@/status";

/// Builder for the bridge key expressions.
#[derive(Debug, Clone)]
pub struct KeyExprBuilder {
    prefix: String,
}

impl Default for KeyExprBuilder {
    fn default() -> Self {
        Self::new(KEY_PREFIX)
    }
}

impl KeyExprBuilder {
    /// Create a builder with a custom prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key on which a sensor's emissions are published.
    ///
    /// # Example
    /// ```
    /// use mbsense_common::keyexpr::KeyExprBuilder;
    ///
    /// let builder = KeyExprBuilder::default();
    /// assert_eq!(builder.event_key("rtu01", "temp"), "mbsense/rtu01/temp");
    /// ```
    pub fn event_key(&self, unit: &str, sensor: &str) -> String {
        format!("{}/{}/{}", self.prefix, unit, sensor)
    }

    /// Key on which requests for `verb` are received. An empty verb addresses
    /// the global verbs.
    pub fn command_key(&self, verb: &str) -> String {
        self.with_verb(verb, COMMAND)
    }

    /// Key on which replies for `verb` are published.
    pub fn reply_key(&self, verb: &str) -> String {
        self.with_verb(verb, REPLY)
    }

    /// Wildcard matching every command key under this prefix.
    ///
    /// # Example
    /// ```
    /// use mbsense_common::keyexpr::KeyExprBuilder;
    ///
    /// assert_eq!(KeyExprBuilder::default().command_wildcard(), "mbsense/**/@/cmd");
    /// ```
    pub fn command_wildcard(&self) -> String {
        format!("{}/**/{}", self.prefix, COMMAND)
    }

    /// Wildcard matching every sensor event under this prefix.
    pub fn event_wildcard(&self) -> String {
        format!("{}/*/*", self.prefix)
    }

    pub fn status_key(&self) -> String {
        format!("{}/{}", self.prefix, STATUS)
    }

    fn with_verb(&self, verb: &str, suffix: &str) -> String {
        if verb.is_empty() {
            format!("{}/{}", self.prefix, suffix)
        } else {
            format!("{}/{}/{}", self.prefix, verb, suffix)
        }
    }
}

/// Parsed form of a bridge key expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedKeyExpr<'a> {
    /// Sensor event key.
    Event { unit: &'a str, sensor: &'a str },
    /// Request key; `verb` is empty for global verbs.
    Command { verb: &'a str },
    /// Reply key; `verb` is empty for global verbs.
    Reply { verb: &'a str },
    /// Bridge status key.
    Status,
}

/// Parse a key expression published under `prefix`.
///
/// Returns `None` if the key does not belong to the prefix or does not match
/// any of the known shapes.
pub fn parse_key_expr<'a>(prefix: &str, key: &'a str) -> Option<ParsedKeyExpr<'a>> {
    let rest = key.strip_prefix(prefix)?.strip_prefix('/')?;

    if rest == STATUS {
        return Some(ParsedKeyExpr::Status);
    }
    if let Some(verb) = strip_verb(rest, COMMAND) {
        return Some(ParsedKeyExpr::Command { verb });
    }
    if let Some(verb) = strip_verb(rest, REPLY) {
        return Some(ParsedKeyExpr::Reply { verb });
    }

    let mut parts = rest.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(unit), Some(sensor), None)
            if !unit.is_empty() && !sensor.is_empty() && !unit.starts_with('@') =>
        {
            Some(ParsedKeyExpr::Event { unit, sensor })
        }
        _ => None,
    }
}

fn strip_verb<'a>(rest: &'a str, suffix: &str) -> Option<&'a str> {
    if rest == suffix {
        return Some("");
    }
    rest.strip_suffix(suffix)?.strip_suffix('/')
}
