//! Hardware profile tables
//!
//! A MIG-capable device creates partitions by *profile id*, not by size. The
//! mapping from slice count to profile id differs between device families, so
//! it lives here as data rather than in the allocators.

use serde::{Deserialize, Serialize};

use crate::{MigError, MigResult};

/// Native profile identifier selecting a partition geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(pub u32);

impl std::fmt::Display for ProfileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// One row of a profile table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileEntry {
    /// Partition size in slices
    pub slices: u32,
    /// Profile id for a device-level partition of this size
    pub device_partition_profile: ProfileId,
    /// Profile id for a compute-level partition of this size
    pub compute_partition_profile: ProfileId,
}

impl ProfileEntry {
    const fn new(slices: u32, device_partition_profile: u32, compute_partition_profile: u32) -> Self {
        Self {
            slices,
            device_partition_profile: ProfileId(device_partition_profile),
            compute_partition_profile: ProfileId(compute_partition_profile),
        }
    }
}

/// Capability descriptor for a device family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Family name (e.g. "a100")
    pub name: String,
    /// Number of slices in an unpartitioned device
    pub total_slices: u32,
    /// Valid partition sizes and their profile ids
    pub entries: Vec<ProfileEntry>,
}

impl DeviceProfile {
    /// A100 40GB: seven compute slices
    pub fn a100() -> Self {
        Self {
            name: "a100".to_string(),
            total_slices: 7,
            entries: vec![
                ProfileEntry::new(1, 19, 0),
                ProfileEntry::new(2, 14, 1),
                ProfileEntry::new(3, 9, 2),
                ProfileEntry::new(4, 5, 3),
                ProfileEntry::new(7, 0, 4),
            ],
        }
    }

    /// A30: four compute slices
    pub fn a30() -> Self {
        Self {
            name: "a30".to_string(),
            total_slices: 4,
            entries: vec![
                ProfileEntry::new(1, 14, 0),
                ProfileEntry::new(2, 5, 1),
                ProfileEntry::new(4, 0, 3),
            ],
        }
    }

    /// Look up a built-in profile by family name
    pub fn builtin(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "a100" => Some(Self::a100()),
            "a30" => Some(Self::a30()),
            _ => None,
        }
    }

    /// Names accepted by [`DeviceProfile::builtin`]
    pub fn builtin_names() -> &'static [&'static str] {
        &["a100", "a30"]
    }

    fn entry(&self, slices: u32) -> MigResult<&ProfileEntry> {
        self.entries
            .iter()
            .find(|e| e.slices == slices)
            .ok_or(MigError::InvalidSliceCount(slices))
    }

    /// Profile id for a device-level partition of `slices`
    pub fn device_partition_profile(&self, slices: u32) -> MigResult<ProfileId> {
        self.entry(slices).map(|e| e.device_partition_profile)
    }

    /// Profile id for a compute-level partition of `slices`
    pub fn compute_partition_profile(&self, slices: u32) -> MigResult<ProfileId> {
        self.entry(slices).map(|e| e.compute_partition_profile)
    }

    /// Fails with `InvalidSliceCount` unless `slices` is in the table
    pub fn check_slices(&self, slices: u32) -> MigResult<()> {
        self.entry(slices).map(|_| ())
    }

    /// Slice counts from smallest to largest
    pub fn valid_slices(&self) -> Vec<u32> {
        let mut slices: Vec<u32> = self.entries.iter().map(|e| e.slices).collect();
        slices.sort_unstable();
        slices
    }

    /// Reverse lookup of a device-level profile id
    pub fn slices_for_device_profile(&self, profile: ProfileId) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.device_partition_profile == profile)
            .map(|e| e.slices)
    }

    /// Reverse lookup of a compute-level profile id
    pub fn slices_for_compute_profile(&self, profile: ProfileId) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.compute_partition_profile == profile)
            .map(|e| e.slices)
    }

    /// Check the table is usable by the allocators
    pub fn validate(&self) -> MigResult<()> {
        if self.entries.is_empty() {
            return Err(MigError::Config(format!(
                "profile '{}' has no entries",
                self.name
            )));
        }

        let slices = self.valid_slices();
        if slices.windows(2).any(|w| w[0] == w[1]) {
            return Err(MigError::Config(format!(
                "profile '{}' lists a slice count more than once",
                self.name
            )));
        }
        if slices.first() != Some(&1) {
            return Err(MigError::Config(format!(
                "profile '{}' has no single-slice entry",
                self.name
            )));
        }
        if slices.last() != Some(&self.total_slices) {
            return Err(MigError::Config(format!(
                "profile '{}' has no entry spanning all {} slices",
                self.name, self.total_slices
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_a100_lookups() {
        let profile = DeviceProfile::a100();
        assert_eq!(profile.device_partition_profile(1).unwrap(), ProfileId(19));
        assert_eq!(profile.device_partition_profile(7).unwrap(), ProfileId(0));
        assert_eq!(profile.compute_partition_profile(3).unwrap(), ProfileId(2));
        assert_eq!(profile.valid_slices(), vec![1, 2, 3, 4, 7]);
    }

    #[test]
    fn test_invalid_slice_counts() {
        let profile = DeviceProfile::a100();
        for slices in [0, 5, 6, 8] {
            assert!(matches!(
                profile.device_partition_profile(slices),
                Err(MigError::InvalidSliceCount(n)) if n == slices
            ));
            assert!(profile.compute_partition_profile(slices).is_err());
        }
    }

    #[test]
    fn test_reverse_lookup() {
        let profile = DeviceProfile::a30();
        assert_eq!(profile.slices_for_device_profile(ProfileId(5)), Some(2));
        assert_eq!(profile.slices_for_compute_profile(ProfileId(3)), Some(4));
        assert_eq!(profile.slices_for_device_profile(ProfileId(19)), None);
    }

    #[test]
    fn test_builtins_validate() {
        for name in DeviceProfile::builtin_names() {
            let profile = DeviceProfile::builtin(name).unwrap();
            assert!(profile.validate().is_ok(), "{} should validate", name);
        }
        assert!(DeviceProfile::builtin("A100").is_some());
        assert!(DeviceProfile::builtin("h200").is_none());
    }

    #[test]
    fn test_validate_rejects_bad_tables() {
        let mut profile = DeviceProfile::a100();
        profile.entries.retain(|e| e.slices != 7);
        assert!(matches!(profile.validate(), Err(MigError::Config(_))));

        let mut profile = DeviceProfile::a100();
        profile.entries.push(ProfileEntry::new(2, 15, 1));
        assert!(profile.validate().is_err());

        let empty = DeviceProfile {
            name: "empty".to_string(),
            total_slices: 1,
            entries: Vec::new(),
        };
        assert!(empty.validate().is_err());
    }
}
