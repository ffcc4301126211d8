//! Terminal-to-contact assignments for the switch box.
//!
//! A sample has eight contacts `A`-`H` around its edge. An [`Assignment`]
//! says which measurement line (`I+`, `I-`, `V1+`, ...) is connected to which
//! contact. Assignments are written as text (`"I+=A, I-=E, V1+=B, V1-=D"`) or
//! as TOML tables (`{ "I+" = "A", "I-" = "E" }`).

use crate::error::DaqError;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A measurement line on the switch box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Terminal {
    /// Current source high
    #[serde(rename = "I+")]
    CurrentHigh,
    /// Current source low
    #[serde(rename = "I-")]
    CurrentLow,
    /// First voltmeter high
    #[serde(rename = "V1+")]
    Voltage1High,
    /// First voltmeter low
    #[serde(rename = "V1-")]
    Voltage1Low,
    /// Second voltmeter high
    #[serde(rename = "V2+")]
    Voltage2High,
    /// Second voltmeter low
    #[serde(rename = "V2-")]
    Voltage2Low,
}

impl Terminal {
    /// Every terminal
    pub const ALL: [Terminal; 6] = [
        Terminal::CurrentHigh,
        Terminal::CurrentLow,
        Terminal::Voltage1High,
        Terminal::Voltage1Low,
        Terminal::Voltage2High,
        Terminal::Voltage2Low,
    ];

    /// Line name as used on the switch box
    pub fn as_str(self) -> &'static str {
        match self {
            Terminal::CurrentHigh => "I+",
            Terminal::CurrentLow => "I-",
            Terminal::Voltage1High => "V1+",
            Terminal::Voltage1Low => "V1-",
            Terminal::Voltage2High => "V2+",
            Terminal::Voltage2Low => "V2-",
        }
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Terminal {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Terminal::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| DaqError::InvalidParameter(format!("unknown terminal '{}'", name)))
    }
}

/// A sample contact, in order around the sample edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Contact {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
}

impl Contact {
    /// Every contact in ring order
    pub const ALL: [Contact; 8] = [
        Contact::A,
        Contact::B,
        Contact::C,
        Contact::D,
        Contact::E,
        Contact::F,
        Contact::G,
        Contact::H,
    ];

    /// Position on the ring, 0 for `A`
    pub fn index(self) -> usize {
        self as usize
    }

    /// The contact `steps` places further around the ring
    pub fn rotated(self, steps: usize) -> Contact {
        Contact::ALL[(self.index() + steps) % Contact::ALL.len()]
    }

    /// Contact letter
    pub fn letter(self) -> char {
        (b'A' + self as u8) as char
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for Contact {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        let mut chars = name.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Contact::ALL
                .into_iter()
                .find(|contact| contact.letter() == c.to_ascii_uppercase())
                .ok_or_else(|| DaqError::InvalidParameter(format!("unknown contact '{}'", name))),
            _ => Err(DaqError::InvalidParameter(format!(
                "unknown contact '{}'",
                name
            ))),
        }
    }
}

/// Which contact each terminal is connected to.
///
/// Terminals keep the order they were assigned in; the switch box closes
/// relays in that order. A terminal appears at most once and no two
/// terminals share a contact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    entries: Vec<(Terminal, Contact)>,
}

impl Assignment {
    /// Empty assignment (everything disconnected)
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from pairs, rejecting repeated terminals or contacts.
    pub fn from_pairs(
        pairs: impl IntoIterator<Item = (Terminal, Contact)>,
    ) -> Result<Self, DaqError> {
        let mut assignment = Self::new();
        for (terminal, contact) in pairs {
            assignment.assign(terminal, contact)?;
        }
        Ok(assignment)
    }

    /// Connect `terminal` to `contact`.
    pub fn assign(&mut self, terminal: Terminal, contact: Contact) -> Result<(), DaqError> {
        if self.contact(terminal).is_some() {
            return Err(DaqError::InvalidParameter(format!(
                "terminal {} assigned twice",
                terminal
            )));
        }
        if let Some(other) = self.terminal_at(contact) {
            return Err(DaqError::InvalidParameter(format!(
                "contact {} already used by {}",
                contact, other
            )));
        }
        self.entries.push((terminal, contact));
        Ok(())
    }

    /// Contact of `terminal`, if connected
    pub fn contact(&self, terminal: Terminal) -> Option<Contact> {
        self.entries
            .iter()
            .find(|(t, _)| *t == terminal)
            .map(|(_, c)| *c)
    }

    /// Terminal on `contact`, if any
    pub fn terminal_at(&self, contact: Contact) -> Option<Terminal> {
        self.entries
            .iter()
            .find(|(_, c)| *c == contact)
            .map(|(t, _)| *t)
    }

    /// Pairs in assignment order
    pub fn iter(&self) -> impl Iterator<Item = (Terminal, Contact)> + '_ {
        self.entries.iter().copied()
    }

    /// Number of connected terminals
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is connected
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every contact moved `steps` places around the ring.
    ///
    /// Rotation is a bijection on contacts, so the result is valid whenever
    /// `self` is.
    pub fn rotated(&self, steps: usize) -> Assignment {
        Assignment {
            entries: self
                .entries
                .iter()
                .map(|(t, c)| (*t, c.rotated(steps)))
                .collect(),
        }
    }

    /// `self` rotated by 0 through 7 places.
    pub fn all_rotations(&self) -> Vec<Assignment> {
        (0..Contact::ALL.len()).map(|k| self.rotated(k)).collect()
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (terminal, contact)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", terminal, contact)?;
        }
        Ok(())
    }
}

impl FromStr for Assignment {
    type Err = DaqError;

    /// Parse `"I+=A, I-=E"`. `:` is accepted in place of `=`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut assignment = Assignment::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (terminal, contact) = part
                .split_once('=')
                .or_else(|| part.split_once(':'))
                .ok_or_else(|| {
                    DaqError::InvalidParameter(format!(
                        "expected TERMINAL=CONTACT, got '{}'",
                        part
                    ))
                })?;
            assignment.assign(terminal.parse()?, contact.parse()?)?;
        }
        Ok(assignment)
    }
}

impl Serialize for Assignment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (terminal, contact) in &self.entries {
            map.serialize_entry(terminal, contact)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Assignment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(AssignmentVisitor)
    }
}

struct AssignmentVisitor;

impl<'de> Visitor<'de> for AssignmentVisitor {
    type Value = Assignment;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a terminal-to-contact table or text like \"I+=A, I-=E\"")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Assignment, E> {
        v.parse().map_err(E::custom)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Assignment, A::Error> {
        let mut assignment = Assignment::new();
        while let Some((terminal, contact)) = map.next_entry::<Terminal, Contact>()? {
            assignment
                .assign(terminal, contact)
                .map_err(de::Error::custom)?;
        }
        Ok(assignment)
    }
}
