//! Configuration Module - Substrate Tuning Parameters
//!
//! Sizes the heap reservation and fixes the remembered-set granularity.
//! Everything here is read once at [`Heap`](crate::heap::Heap) creation.

/// Main configuration for the substrate
///
/// # Examples
///
/// ```rust
/// use shgc::ShgcConfig;
///
/// let config = ShgcConfig {
///     max_regions: 32,
///     quad_slots: 8,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ShgcConfig {
    /// Region size in bytes
    ///
    /// Must be a power of two and a multiple of the OS page size.
    /// Default: 256KB
    pub region_size: usize,

    /// Number of region descriptors in the address-space reservation
    ///
    /// The reservation is `region_size * max_regions` bytes of anonymous
    /// memory, committed lazily by the OS.
    /// Default: 256
    pub max_regions: usize,

    /// Reference slots per remembered-set quad
    ///
    /// One remembered-set bit covers this many consecutive slots.
    /// Must be a power of two between 1 and 64.
    /// Default: 4
    pub quad_slots: usize,

    /// Objects larger than this get their own Huge region span
    ///
    /// Default: region_size / 2
    pub huge_threshold: usize,

    /// Upper bound on regions handed to the shared heap
    ///
    /// Default: max_regions / 2
    pub max_shared_regions: usize,

    /// Enable substrate statistics counters
    ///
    /// Default: true
    pub stats_enabled: bool,

    /// Enable verbose event logging on the console
    ///
    /// Default: false
    pub verbose: bool,
}

impl Default for ShgcConfig {
    fn default() -> Self {
        let region_size = 256 * KB;
        let max_regions = 256;

        ShgcConfig {
            region_size,
            max_regions,
            quad_slots: 4,
            huge_threshold: region_size / 2,
            max_shared_regions: max_regions / 2,
            stats_enabled: true,
            verbose: false,
        }
    }
}

impl ShgcConfig {
    /// Default configuration for a heap of `max_regions` regions of
    /// `region_size` bytes, with the dependent limits derived the same way
    /// as [`Default`]
    pub fn sized(region_size: usize, max_regions: usize) -> Self {
        ShgcConfig {
            region_size,
            max_regions,
            huge_threshold: region_size / 2,
            max_shared_regions: max_regions / 2,
            ..Default::default()
        }
    }

    /// Validate configuration
    ///
    /// ```rust
    /// use shgc::ShgcConfig;
    ///
    /// let config = ShgcConfig {
    ///     quad_slots: 3, // not a power of two
    ///     ..Default::default()
    /// };
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.region_size.is_power_of_two() {
            return Err(ConfigError::InvalidRegionSize(format!(
                "region_size ({}) must be a power of two",
                self.region_size
            )));
        }

        let page = page_size::get();
        if self.region_size < page || self.region_size % page != 0 {
            return Err(ConfigError::InvalidRegionSize(format!(
                "region_size ({}) must be a multiple of the page size ({})",
                self.region_size, page
            )));
        }

        if self.max_regions == 0 {
            return Err(ConfigError::InvalidRegionCount(
                "max_regions must be > 0".to_string(),
            ));
        }

        if self.region_size.checked_mul(self.max_regions).is_none() {
            return Err(ConfigError::InvalidRegionCount(
                "region_size * max_regions overflows".to_string(),
            ));
        }

        if self.max_shared_regions > self.max_regions {
            return Err(ConfigError::InvalidRegionCount(
                "max_shared_regions cannot exceed max_regions".to_string(),
            ));
        }

        if !self.quad_slots.is_power_of_two() || self.quad_slots > 64 {
            return Err(ConfigError::InvalidQuadSize(format!(
                "quad_slots ({}) must be a power of two in 1..=64",
                self.quad_slots
            )));
        }

        if self.huge_threshold == 0 || self.huge_threshold > self.region_size {
            return Err(ConfigError::InvalidThreshold(format!(
                "huge_threshold ({}) must be in 1..=region_size",
                self.huge_threshold
            )));
        }

        Ok(())
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with:
    /// - SHGC_REGION_SIZE
    /// - SHGC_MAX_REGIONS
    /// - SHGC_QUAD_SLOTS
    /// - SHGC_HUGE_THRESHOLD
    /// - SHGC_VERBOSE
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(size) = env_usize("SHGC_REGION_SIZE") {
            config.region_size = size;
            config.huge_threshold = size / 2;
        }

        if let Some(count) = env_usize("SHGC_MAX_REGIONS") {
            config.max_regions = count;
            config.max_shared_regions = count / 2;
        }

        if let Some(slots) = env_usize("SHGC_QUAD_SLOTS") {
            config.quad_slots = slots;
        }

        if let Some(threshold) = env_usize("SHGC_HUGE_THRESHOLD") {
            config.huge_threshold = threshold;
        }

        if let Ok(val) = std::env::var("SHGC_VERBOSE") {
            config.verbose = val == "1" || val.eq_ignore_ascii_case("true");
        }

        config
    }

    /// log2 of `quad_slots`
    pub fn quad_shift(&self) -> u32 {
        self.quad_slots.trailing_zeros()
    }

    /// Total bytes reserved for the heap
    pub fn reservation_size(&self) -> usize {
        self.region_size * self.max_regions
    }
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid region size: {0}")]
    InvalidRegionSize(String),

    #[error("Invalid region count: {0}")]
    InvalidRegionCount(String),

    #[error("Invalid quad size: {0}")]
    InvalidQuadSize(String),

    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),
}

const KB: usize = 1024;

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.parse::<usize>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ShgcConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.quad_slots, 4);
        assert_eq!(config.quad_shift(), 2);
    }

    #[test]
    fn test_sized_derives_limits() {
        let config = ShgcConfig::sized(64 * KB, 16);
        assert!(config.validate().is_ok());
        assert_eq!(config.huge_threshold, 32 * KB);
        assert_eq!(config.max_shared_regions, 8);
    }

    #[test]
    fn test_invalid_region_size() {
        let config = ShgcConfig {
            region_size: 300 * KB,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRegionSize(_))
        ));
    }

    #[test]
    fn test_invalid_quad_slots() {
        for slots in [0, 3, 128] {
            let config = ShgcConfig {
                quad_slots: slots,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "quad_slots={} accepted", slots);
        }
    }

    #[test]
    fn test_shared_regions_bounded() {
        let config = ShgcConfig {
            max_regions: 4,
            max_shared_regions: 8,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRegionCount(_))
        ));
    }

    #[test]
    fn test_huge_threshold_bounds() {
        let config = ShgcConfig {
            huge_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
