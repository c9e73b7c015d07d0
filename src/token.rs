//! Capability tokens held by each device.
//!
//! Tokens are supplied as `serial:token` pairs (for example
//! `emulator-5554:sim-card`). A serial may appear several times; its
//! tokens accumulate into one set. The token follows the last colon, so
//! network serials such as `192.168.1.5:5555` work unchanged.

use std::collections::{BTreeSet, HashMap};

/// Result type for token table operations.
pub type TokenResult<T> = Result<T, TokenError>;

/// Errors produced while parsing token assignments.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The assignment was not of the form `serial:token`.
    #[error("Malformed token assignment '{0}': expected 'serial:token'")]
    Malformed(String),
}

/// Maps a device serial to the capability tokens it holds.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTokenTable {
    tokens: HashMap<String, BTreeSet<String>>,
}

impl CapabilityTokenTable {
    /// Parses `serial:token` assignments into a table.
    ///
    /// # Example
    ///
    /// ```
    /// use modshard::token::CapabilityTokenTable;
    ///
    /// let table = CapabilityTokenTable::parse(&[
    ///     "serial-a:sim".to_string(),
    ///     "serial-a:nfc".to_string(),
    /// ])?;
    /// assert_eq!(table.tokens_for("serial-a").len(), 2);
    /// assert!(table.tokens_for("serial-b").is_empty());
    /// # Ok::<(), modshard::token::TokenError>(())
    /// ```
    pub fn parse(assignments: &[String]) -> TokenResult<Self> {
        let mut table = Self::default();
        for assignment in assignments {
            let (serial, token) = assignment
                .rsplit_once(':')
                .map(|(s, t)| (s.trim(), t.trim()))
                .filter(|(s, t)| !s.is_empty() && !t.is_empty())
                .ok_or_else(|| TokenError::Malformed(assignment.clone()))?;
            table.insert(serial, token);
        }
        Ok(table)
    }

    /// Grants `token` to the device with the given serial.
    pub fn insert(&mut self, serial: impl Into<String>, token: impl Into<String>) {
        self.tokens
            .entry(serial.into())
            .or_default()
            .insert(token.into());
    }

    /// Returns the tokens held by `serial`; empty if it holds none.
    pub fn tokens_for(&self, serial: &str) -> BTreeSet<String> {
        self.tokens.get(serial).cloned().unwrap_or_default()
    }

    /// Returns `true` if `serial` holds every token in `required`.
    pub fn satisfies(&self, serial: &str, required: &BTreeSet<String>) -> bool {
        match self.tokens.get(serial) {
            Some(held) => required.is_subset(held),
            None => required.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_tokens_accumulate_per_serial() {
        let table = CapabilityTokenTable::parse(&[
            "A:sim".to_string(),
            "A:nfc".to_string(),
            "B:sim".to_string(),
        ])
        .unwrap();
        assert_eq!(table.tokens_for("A"), set(&["nfc", "sim"]));
        assert_eq!(table.tokens_for("B"), set(&["sim"]));
        assert!(table.tokens_for("C").is_empty());
    }

    #[test]
    fn test_satisfies_subset() {
        let table = CapabilityTokenTable::parse(&["A:sim".to_string(), "A:nfc".to_string()])
            .unwrap();
        assert!(table.satisfies("A", &set(&["sim"])));
        assert!(table.satisfies("A", &set(&["sim", "nfc"])));
        assert!(!table.satisfies("A", &set(&["sim", "wifi"])));
        assert!(!table.satisfies("B", &set(&["sim"])));
        assert!(table.satisfies("B", &BTreeSet::new()));
    }

    #[test]
    fn test_network_serial_keeps_its_port() {
        let table = CapabilityTokenTable::parse(&[
            "192.168.1.5:5555:sim".to_string(),
            "192.168.1.5:5555:nfc".to_string(),
        ])
        .unwrap();
        assert_eq!(table.tokens_for("192.168.1.5:5555"), set(&["nfc", "sim"]));
        assert!(table.tokens_for("192.168.1.5").is_empty());
    }

    #[test]
    fn test_malformed_assignments() {
        for bad in ["no-colon", ":sim", "A:", "192.168.1.5:5555:"] {
            assert!(
                CapabilityTokenTable::parse(&[bad.to_string()]).is_err(),
                "{bad} should be rejected"
            );
        }
    }
}
