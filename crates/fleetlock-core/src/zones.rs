//! Zone extension engine.
//!
//! Pure computation — no storage, no async. Reconciles the logical locker
//! ranges a kiosk advertises against the physical relay-card inventory
//! wired to it, and maps a locker id to the relay channel that actually
//! opens it. Kept free of I/O so the reconciliation math itself is trivial
//! to test exhaustively.

use serde::{Deserialize, Serialize};

use crate::error::ZoneError;

/// Addressable channels per relay card. Fixed by the hardware, not configurable.
pub const CHANNELS_PER_CARD: u32 = 16;

/// One physical relay card present on the Modbus bus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RelayCard {
    pub slave_address: u32,
    pub enabled: bool,
}

/// An inclusive, contiguous range of locker ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockerRange {
    pub start: i32,
    pub end: i32,
}

impl LockerRange {
    #[must_use]
    pub fn len(&self) -> u32 {
        (self.end - self.start + 1).max(0) as u32
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    #[must_use]
    pub fn contains(&self, locker_id: i32) -> bool {
        locker_id >= self.start && locker_id <= self.end
    }
}

/// A logical zone: an ordered set of locker ranges backed by a list of
/// relay-card slave addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub enabled: bool,
    pub ranges: Vec<LockerRange>,
    pub relay_cards: Vec<u32>,
}

impl Zone {
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.relay_cards.len() as u32 * CHANNELS_PER_CARD
    }

    #[must_use]
    pub fn covered(&self) -> u32 {
        self.ranges.iter().map(LockerRange::len).sum()
    }
}

/// A kiosk's full zone configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub zones: Vec<Zone>,
}

fn valid_zone_id_chars(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validate zone ids, card references, wiring sufficiency, and overlap.
/// Returns warnings for gaps between enabled zones (not rejected).
///
/// # Errors
///
/// - [`ZoneError::InvalidZoneId`] if an id is empty, duplicated, or uses
///   characters outside `[A-Za-z0-9_-]`.
/// - [`ZoneError::UnknownRelayCard`] if a zone references a card not in
///   `hardware`.
/// - [`ZoneError::InsufficientHardware`] if a zone's covered range exceeds
///   its wired capacity.
/// - [`ZoneError::OverlappingRanges`] if two enabled zones overlap.
pub fn validate(config: &ZoneConfig, hardware: &[RelayCard]) -> Result<Vec<String>, ZoneError> {
    let known_slaves: std::collections::HashSet<u32> = hardware.iter().map(|c| c.slave_address).collect();
    let mut seen_ids = std::collections::HashSet::new();

    for zone in &config.zones {
        if !valid_zone_id_chars(&zone.id) {
            return Err(ZoneError::InvalidZoneId {
                zone: zone.id.clone(),
                reason: "must be non-empty and use only [A-Za-z0-9_-]",
            });
        }
        if !seen_ids.insert(zone.id.clone()) {
            return Err(ZoneError::InvalidZoneId { zone: zone.id.clone(), reason: "duplicated zone id" });
        }

        for slave in &zone.relay_cards {
            if !known_slaves.contains(slave) {
                return Err(ZoneError::UnknownRelayCard { zone: zone.id.clone(), slave_address: *slave });
            }
        }

        if zone.enabled {
            let covered = zone.covered();
            let capacity = zone.capacity();
            if covered > capacity {
                return Err(ZoneError::InsufficientHardware {
                    zone: zone.id.clone(),
                    needed: covered,
                    available: capacity,
                });
            }
        }
    }

    let mut enabled: Vec<&Zone> = config.zones.iter().filter(|z| z.enabled).collect();
    for (i, a) in enabled.iter().enumerate() {
        for b in &enabled[i + 1..] {
            for ra in &a.ranges {
                for rb in &b.ranges {
                    if ra.start <= rb.end && rb.start <= ra.end {
                        return Err(ZoneError::OverlappingRanges { a: a.id.clone(), b: b.id.clone() });
                    }
                }
            }
        }
    }

    enabled.sort_by_key(|z| z.ranges.iter().map(|r| r.start).min().unwrap_or(i32::MAX));
    let mut warnings = Vec::new();
    let mut expected_next = 1i32;
    for zone in &enabled {
        let mut sorted = zone.ranges.clone();
        sorted.sort_by_key(|r| r.start);
        for range in &sorted {
            if range.is_empty() {
                continue;
            }
            if range.start > expected_next {
                warnings.push(format!(
                    "gap in locker coverage: lockers {expected_next}..{} are unassigned",
                    range.start - 1
                ));
            }
            expected_next = (range.end + 1).max(expected_next);
        }
    }

    Ok(warnings)
}

/// Result of a reconciliation pass: the rebalanced config plus, if the
/// `total` capacity grew past what the enabled zones already covered, a
/// record of the extension applied to the last enabled zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionDiff {
    pub zone_id: String,
    pub new_range: LockerRange,
    pub merged_ranges: Vec<LockerRange>,
    pub newly_assigned_cards: Vec<u32>,
}

/// Reconcile `config` against the observed hardware: recompute each enabled
/// zone's range from its currently-assigned card count, then extend the
/// last enabled zone (assigning spare cards from the unassigned pool) to
/// cover any capacity added since the config was last reconciled.
#[must_use]
pub fn reconcile(mut config: ZoneConfig, hardware: &[RelayCard]) -> (ZoneConfig, Option<ExtensionDiff>) {
    let total = hardware.iter().filter(|c| c.enabled).count() as u32 * CHANNELS_PER_CARD;

    let mut next_start = 1i32;
    for zone in config.zones.iter_mut().filter(|z| z.enabled) {
        let capacity = zone.capacity();
        if next_start as u32 > total {
            zone.ranges = vec![];
        } else {
            let end = (next_start + capacity as i32 - 1).min(total as i32);
            zone.ranges = if end >= next_start { vec![LockerRange { start: next_start, end }] } else { vec![] };
        }
        next_start += capacity as i32;
    }

    let covered: u32 = config.zones.iter().filter(|z| z.enabled).map(Zone::covered).sum();
    if covered >= total {
        return (config, None);
    }

    let Some(last_idx) = config.zones.iter().rposition(|z| z.enabled) else {
        return (config, None);
    };

    let assigned: std::collections::HashSet<u32> =
        config.zones.iter().flat_map(|z| z.relay_cards.iter().copied()).collect();
    let mut unassigned: Vec<u32> =
        hardware.iter().filter(|c| c.enabled && !assigned.contains(&c.slave_address)).map(|c| c.slave_address).collect();
    unassigned.sort_unstable();

    let zone = &mut config.zones[last_idx];
    let new_range = LockerRange { start: covered as i32 + 1, end: total as i32 };

    let mut newly_assigned = Vec::new();
    let mut needed = new_range.len();
    let already_free = zone.capacity().saturating_sub(zone.covered());
    needed = needed.saturating_sub(already_free);
    for slave in unassigned {
        if needed == 0 {
            break;
        }
        zone.relay_cards.push(slave);
        newly_assigned.push(slave);
        needed = needed.saturating_sub(CHANNELS_PER_CARD);
    }

    let merged_ranges = merge_adjacent(&zone.ranges, new_range);
    zone.ranges = merged_ranges.clone();

    (config, Some(ExtensionDiff { zone_id: zone.id.clone(), new_range, merged_ranges, newly_assigned_cards: newly_assigned }))
}

fn merge_adjacent(existing: &[LockerRange], addition: LockerRange) -> Vec<LockerRange> {
    let mut ranges: Vec<LockerRange> = existing.iter().filter(|r| !r.is_empty()).copied().collect();
    ranges.push(addition);
    ranges.sort_by_key(|r| r.start);

    let mut merged: Vec<LockerRange> = Vec::new();
    for range in ranges {
        if let Some(last) = merged.last_mut() {
            if range.start <= last.end + 1 {
                last.end = last.end.max(range.end);
                continue;
            }
        }
        merged.push(range);
    }
    merged
}

/// Map a locker id to its `(slave_address, coil, zone_id)` within its zone.
/// `coil` is 1-based within the card's 16 channels.
///
/// # Errors
///
/// - [`ZoneError::UnmappedLocker`] if no enabled zone covers the id.
/// - [`ZoneError::InsufficientHardware`] if the zone's position resolves to
///   a card index it doesn't have wired.
pub fn map_locker(config: &ZoneConfig, locker_id: i32) -> Result<(u32, u32, String), ZoneError> {
    let zone = config
        .zones
        .iter()
        .find(|z| z.enabled && z.ranges.iter().any(|r| r.contains(locker_id)))
        .ok_or(ZoneError::UnmappedLocker { locker_id })?;

    let mut sorted = zone.ranges.clone();
    sorted.sort_by_key(|r| r.start);

    let mut position = 0i32;
    for range in &sorted {
        if range.contains(locker_id) {
            position += locker_id - range.start + 1;
            break;
        }
        position += range.len() as i32;
    }

    let card_index = ((position - 1) / CHANNELS_PER_CARD as i32) as usize;
    let coil = ((position - 1) % CHANNELS_PER_CARD as i32) as u32 + 1;
    let slave_address = zone.relay_cards.get(card_index).copied().ok_or(ZoneError::InsufficientHardware {
        zone: zone.id.clone(),
        needed: position as u32,
        available: zone.capacity(),
    })?;

    Ok((slave_address, coil, zone.id.clone()))
}

/// Legacy contiguous mapping used when zones are disabled entirely: lockers
/// are numbered straight across cards starting at slave address 1.
#[must_use]
pub fn map_locker_legacy(locker_id: i32) -> (u32, u32) {
    let position = (locker_id.max(1) - 1) as u32;
    let card_index = position / CHANNELS_PER_CARD;
    let coil = position % CHANNELS_PER_CARD + 1;
    (card_index + 1, coil)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn hardware(slaves: &[u32]) -> Vec<RelayCard> {
        slaves.iter().map(|&s| RelayCard { slave_address: s, enabled: true }).collect()
    }

    fn sample_config() -> ZoneConfig {
        ZoneConfig {
            zones: vec![
                Zone {
                    id: "A".to_owned(),
                    enabled: true,
                    ranges: vec![LockerRange { start: 1, end: 16 }],
                    relay_cards: vec![1],
                },
                Zone {
                    id: "B".to_owned(),
                    enabled: true,
                    ranges: vec![LockerRange { start: 17, end: 32 }],
                    relay_cards: vec![2],
                },
            ],
        }
    }

    #[test]
    fn validate_accepts_non_overlapping_well_wired_zones() {
        let config = sample_config();
        let warnings = validate(&config, &hardware(&[1, 2])).unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn validate_rejects_overlapping_ranges() {
        let mut config = sample_config();
        config.zones[1].ranges = vec![LockerRange { start: 10, end: 25 }];
        let err = validate(&config, &hardware(&[1, 2])).unwrap_err();
        assert!(matches!(err, ZoneError::OverlappingRanges { .. }));
    }

    #[test]
    fn validate_rejects_underwired_zone() {
        let mut config = sample_config();
        config.zones[0].ranges = vec![LockerRange { start: 1, end: 32 }];
        let err = validate(&config, &hardware(&[1, 2])).unwrap_err();
        assert!(matches!(err, ZoneError::InsufficientHardware { .. }));
    }

    #[test]
    fn validate_rejects_unknown_card_reference() {
        let config = sample_config();
        let err = validate(&config, &hardware(&[1])).unwrap_err();
        assert!(matches!(err, ZoneError::UnknownRelayCard { slave_address: 2, .. }));
    }

    #[test]
    fn validate_rejects_invalid_zone_id() {
        let mut config = sample_config();
        config.zones[0].id = "bad zone!".to_owned();
        let err = validate(&config, &hardware(&[1, 2])).unwrap_err();
        assert!(matches!(err, ZoneError::InvalidZoneId { .. }));
    }

    #[test]
    fn validate_warns_on_gap_between_zones() {
        let mut config = sample_config();
        config.zones[1].ranges = vec![LockerRange { start: 20, end: 35 }];
        let warnings = validate(&config, &hardware(&[1, 2])).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("17..19"));
    }

    #[test]
    fn map_locker_resolves_card_and_coil() {
        let config = sample_config();
        let (slave, coil, zone_id) = map_locker(&config, 20).unwrap();
        assert_eq!(slave, 2);
        assert_eq!(coil, 4);
        assert_eq!(zone_id, "B");
    }

    #[test]
    fn map_locker_rejects_unconfigured_id() {
        let config = sample_config();
        let err = map_locker(&config, 99).unwrap_err();
        assert!(matches!(err, ZoneError::UnmappedLocker { .. }));
    }

    #[test]
    fn map_locker_legacy_starts_at_slave_one() {
        assert_eq!(map_locker_legacy(1), (1, 1));
        assert_eq!(map_locker_legacy(16), (1, 16));
        assert_eq!(map_locker_legacy(17), (2, 1));
    }

    #[test]
    fn reconcile_extends_last_zone_when_card_added() {
        // S5: zone A covers 1-16 on slave 1; slave 2 (16 channels) appears
        // unassigned. total becomes 32; A should extend to 1-32 and absorb
        // slave 2.
        let config = ZoneConfig {
            zones: vec![Zone {
                id: "A".to_owned(),
                enabled: true,
                ranges: vec![LockerRange { start: 1, end: 16 }],
                relay_cards: vec![1],
            }],
        };
        let (reconciled, diff) = reconcile(config, &hardware(&[1, 2]));
        let zone_a = &reconciled.zones[0];
        assert_eq!(zone_a.ranges, vec![LockerRange { start: 1, end: 32 }]);
        assert_eq!(zone_a.relay_cards, vec![1, 2]);

        let diff = diff.unwrap();
        assert_eq!(diff.zone_id, "A");
        assert_eq!(diff.newly_assigned_cards, vec![2]);
        assert_eq!(diff.merged_ranges, vec![LockerRange { start: 1, end: 32 }]);

        let (slave, coil, _) = map_locker(&reconciled, 20).unwrap();
        assert_eq!(slave, 2);
        assert_eq!(coil, 4);
    }

    #[test]
    fn reconcile_is_noop_when_capacity_already_covered() {
        let config = sample_config();
        let (reconciled, diff) = reconcile(config, &hardware(&[1, 2]));
        assert!(diff.is_none());
        assert_eq!(reconciled.zones[0].ranges, vec![LockerRange { start: 1, end: 16 }]);
        assert_eq!(reconciled.zones[1].ranges, vec![LockerRange { start: 17, end: 32 }]);
    }
}
