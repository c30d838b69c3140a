/// Configuration for the ringsock engine.
#[derive(Clone)]
pub struct Config {
    /// Number of SQ entries. CQ depth is left at the kernel default.
    pub sq_entries: u32,
    /// Number of entries in the aligned iovec table. Bounds how many
    /// read/write operations a single submission batch may encode.
    pub iovec_entries: u32,
    /// Name given to the I/O thread.
    pub thread_name: String,
    /// Whether to pin the I/O thread to a CPU core.
    pub pin_to_core: bool,
    /// CPU core index used when `pin_to_core` is set.
    pub core: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sq_entries: 512,
            iovec_entries: 256,
            thread_name: "ringsock-io".to_string(),
            pin_to_core: false,
            core: 0,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.sq_entries < 2 || !self.sq_entries.is_power_of_two() {
            return Err(crate::error::Error::RingSetup(
                "sq_entries must be >= 2 and a power of two".into(),
            ));
        }
        if self.iovec_entries == 0 {
            return Err(crate::error::Error::RingSetup(
                "iovec_entries must be > 0".into(),
            ));
        }
        // Each read/write consumes 2 SQEs, so a table larger than sq_entries / 2
        // can never be filled within one batch.
        if self.iovec_entries > self.sq_entries / 2 {
            return Err(crate::error::Error::RingSetup(
                "iovec_entries must be <= sq_entries / 2".into(),
            ));
        }
        Ok(())
    }

    /// Apply the configured CPU affinity to the calling thread. A no-op
    /// unless `pin_to_core` is set.
    pub(crate) fn apply_affinity(&self) -> Result<(), crate::error::Error> {
        if !self.pin_to_core {
            return Ok(());
        }
        if self.core >= libc::CPU_SETSIZE as usize {
            return Err(crate::error::Error::ThreadSetup(format!(
                "core {} does not fit in cpu_set_t (max {})",
                self.core,
                libc::CPU_SETSIZE - 1
            )));
        }
        // Safety: a zeroed cpu_set_t is a valid empty set, and the core
        // index was bounds-checked above.
        let rc = unsafe {
            let mut cpus: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_SET(self.core, &mut cpus);
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpus)
        };
        if rc != 0 {
            return Err(crate::error::Error::ThreadSetup(format!(
                "pinning '{}' to core {}: {}",
                self.thread_name,
                self.core,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use ringsock::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .sq_entries(512)
///     .iovec_entries(128)
///     .thread_name("io")
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of SQ entries. Must be a power of two.
    pub fn sq_entries(mut self, n: u32) -> Self {
        self.config.sq_entries = n;
        self
    }

    /// Set the size of the iovec table (read/write ops per submission batch).
    pub fn iovec_entries(mut self, n: u32) -> Self {
        self.config.iovec_entries = n;
        self
    }

    /// Set the I/O thread name.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Pin the I/O thread to the given CPU core.
    pub fn pin_to_core(mut self, core: usize) -> Self {
        self.config.pin_to_core = true;
        self.config.core = core;
        self
    }

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
