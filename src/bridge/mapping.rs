//! Channel mapping registry.
//!
//! Holds the active set of IRC <-> Discord channel pairs and computes the
//! part/join work needed when the set is replaced at runtime.

use std::collections::HashSet;

use tracing::debug;

use crate::common::error::BridgeError;
use crate::config::types::ChannelMapping;

/// A bound pair of one IRC channel and one Discord channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mapping {
    pub irc_channel: String,
    pub discord_channel: String,
}

impl Mapping {
    pub fn new(irc_channel: impl Into<String>, discord_channel: impl Into<String>) -> Self {
        Self {
            irc_channel: irc_channel.into(),
            discord_channel: discord_channel.into(),
        }
    }
}

impl From<&ChannelMapping> for Mapping {
    fn from(mapping: &ChannelMapping) -> Self {
        Mapping::new(mapping.irc.clone(), mapping.discord.clone())
    }
}

/// Channel membership changes to apply after the mapping set changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// IRC channels to leave. A channel that is re-added under a new
    /// mapping in the same change is never listed here.
    pub part: Vec<String>,
    /// The full set of IRC channels that must be joined.
    pub join: Vec<String>,
}

/// Reject a candidate set in which an IRC or Discord channel repeats.
pub fn check_unique(mappings: &[Mapping]) -> Result<(), BridgeError> {
    let mut irc = HashSet::new();
    let mut discord = HashSet::new();

    for mapping in mappings {
        if !irc.insert(mapping.irc_channel.as_str()) {
            return Err(BridgeError::DuplicateMapping {
                channel: mapping.irc_channel.clone(),
            });
        }
        if !discord.insert(mapping.discord_channel.as_str()) {
            return Err(BridgeError::DuplicateMapping {
                channel: mapping.discord_channel.clone(),
            });
        }
    }

    Ok(())
}

/// The set of active mappings.
#[derive(Debug, Default)]
pub struct MappingRegistry {
    /// `None` until the first configuration is installed.
    mappings: Option<Vec<Mapping>>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active mapping set.
    ///
    /// Nothing is changed when the candidates contain duplicates. The first
    /// installation needs no reconciliation and returns `None`.
    pub fn set_mappings(
        &mut self,
        candidates: Vec<Mapping>,
    ) -> Result<Option<Reconciliation>, BridgeError> {
        check_unique(&candidates)?;

        let Some(previous) = self.mappings.replace(candidates) else {
            return Ok(None);
        };
        let current = self.mappings.as_deref().unwrap_or_default();

        let added: Vec<&Mapping> = current.iter().filter(|m| !previous.contains(m)).collect();
        let removed: Vec<&Mapping> = previous.iter().filter(|m| !current.contains(m)).collect();

        // Swapping the Discord side of an IRC channel must not part it.
        let part = removed
            .iter()
            .filter(|old| !added.iter().any(|new| new.irc_channel == old.irc_channel))
            .map(|old| old.irc_channel.clone())
            .collect();

        debug!(
            added = added.len(),
            removed = removed.len(),
            "Channel mappings replaced"
        );

        Ok(Some(Reconciliation {
            part,
            join: self.irc_channels(),
        }))
    }

    /// Find the mapping for an IRC channel.
    pub fn by_irc(&self, channel: &str) -> Option<&Mapping> {
        self.iter().find(|m| m.irc_channel == channel)
    }

    /// Find the mapping for a Discord channel.
    pub fn by_discord(&self, channel_id: &str) -> Option<&Mapping> {
        self.iter().find(|m| m.discord_channel == channel_id)
    }

    /// IRC channels of every active mapping.
    pub fn irc_channels(&self) -> Vec<String> {
        self.iter().map(|m| m.irc_channel.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(mappings: &[(&str, &str)]) -> MappingRegistry {
        let mut registry = MappingRegistry::new();
        registry
            .set_mappings(mappings.iter().map(|(i, d)| Mapping::new(*i, *d)).collect())
            .unwrap();
        registry
    }

    #[test]
    fn test_first_configuration_needs_no_reconciliation() {
        let mut registry = MappingRegistry::new();
        let result = registry
            .set_mappings(vec![Mapping::new("#a", "100")])
            .unwrap();

        assert_eq!(result, None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_irc_channel_rejected() {
        let mut registry = registry_with(&[("#a", "100")]);
        let result = registry.set_mappings(vec![
            Mapping::new("#b", "200"),
            Mapping::new("#b", "300"),
        ]);

        assert!(matches!(
            result,
            Err(BridgeError::DuplicateMapping { ref channel }) if channel == "#b"
        ));
        // Nothing was mutated
        assert_eq!(registry.irc_channels(), vec!["#a".to_string()]);
    }

    #[test]
    fn test_duplicate_discord_channel_rejected() {
        let mut registry = MappingRegistry::new();
        let result = registry.set_mappings(vec![
            Mapping::new("#a", "100"),
            Mapping::new("#b", "100"),
        ]);

        assert!(result.is_err());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_unique_sets_accepted() {
        let sets: &[&[(&str, &str)]] = &[
            &[],
            &[("#a", "1")],
            &[("#a", "1"), ("#b", "2"), ("#c", "3")],
        ];
        for set in sets {
            let mappings: Vec<Mapping> = set.iter().map(|(i, d)| Mapping::new(*i, *d)).collect();
            assert!(check_unique(&mappings).is_ok(), "{:?}", set);
        }
    }

    #[test]
    fn test_swap_does_not_part() {
        let mut registry = registry_with(&[("#a", "100"), ("#b", "200")]);
        let result = registry
            .set_mappings(vec![Mapping::new("#a", "100"), Mapping::new("#b", "300")])
            .unwrap()
            .unwrap();

        assert!(result.part.is_empty());
        assert_eq!(result.join, vec!["#a".to_string(), "#b".to_string()]);
        assert_eq!(registry.by_irc("#b").unwrap().discord_channel, "300");
        assert!(registry.by_discord("200").is_none());
    }

    #[test]
    fn test_removal_parts_channel() {
        let mut registry = registry_with(&[("#a", "100"), ("#b", "200")]);
        let result = registry
            .set_mappings(vec![Mapping::new("#a", "100")])
            .unwrap()
            .unwrap();

        assert_eq!(result.part, vec!["#b".to_string()]);
        assert_eq!(result.join, vec!["#a".to_string()]);
        assert!(registry.by_irc("#b").is_none());
    }

    #[test]
    fn test_lookup_by_both_sides() {
        let registry = registry_with(&[("#general", "100")]);

        assert_eq!(registry.by_irc("#general").unwrap().discord_channel, "100");
        assert_eq!(registry.by_discord("100").unwrap().irc_channel, "#general");
        assert!(registry.by_irc("#nope").is_none());
    }
}
