//! Field codec for the host command protocol
//!
//! A frame is a single line of text: the verb followed by its arguments, all
//! joined with [`SEP`]. Arguments are not escaped, so a value containing the
//! separator splits into several fields on decode. Hosts are expected to keep
//! the separator out of topics and payloads.

use std::fmt;

/// Field separator shared with the host-side library
pub const SEP: char = ',';

/// One decoded protocol line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub verb: String,
    pub args: Vec<String>,
}

impl Frame {
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            args: Vec::new(),
        }
    }

    /// Appends a stringified argument (builder style)
    pub fn arg(mut self, value: impl fmt::Display) -> Self {
        self.args.push(value.to_string());
        self
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Splits a raw line into verb and arguments.
    ///
    /// Trailing line terminators are stripped; everything else is kept
    /// verbatim, including empty fields.
    pub fn decode(raw: &str) -> Self {
        let line = raw.trim_end_matches(['\r', '\n']);
        let mut fields = line.split(SEP).map(str::to_string);
        let verb = fields.next().unwrap_or_default();

        Self {
            verb,
            args: fields.collect(),
        }
    }

    /// Argument at `index`, if present
    pub fn field(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.verb)?;
        for arg in &self.args {
            write!(f, "{}{}", SEP, arg)?;
        }
        Ok(())
    }
}
