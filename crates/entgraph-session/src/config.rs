//! Operation configuration.

/// Tuning knobs for one save or delete operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationConfig {
    /// Execute independent type groups of one wave concurrently.
    pub concurrent_groups: bool,
    /// Delete unloaded referencing rows with `DELETE ... WHERE fk IN (...)`
    /// when their type qualifies, instead of loading them first.
    pub bulk_delete: bool,
    /// Upper bound on values in one `IN` list; larger batches are split.
    /// Read through [`OperationConfig::in_list_limit`].
    pub max_in_values: usize,
    /// Abort with `NotConverged` after this many cycles.
    pub max_cycles: usize,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            concurrent_groups: true,
            bulk_delete: true,
            max_in_values: 500,
            max_cycles: 10_000,
        }
    }
}

impl OperationConfig {
    /// Create new default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `concurrent_groups` option (builder pattern).
    #[must_use]
    pub fn concurrent_groups(mut self, value: bool) -> Self {
        self.concurrent_groups = value;
        self
    }

    /// Set the `bulk_delete` option (builder pattern).
    #[must_use]
    pub fn bulk_delete(mut self, value: bool) -> Self {
        self.bulk_delete = value;
        self
    }

    /// Set the `max_in_values` option (builder pattern). Zero is treated as one.
    #[must_use]
    pub fn max_in_values(mut self, value: usize) -> Self {
        self.max_in_values = value.max(1);
        self
    }

    /// Values per `IN` list, never less than one.
    pub fn in_list_limit(&self) -> usize {
        self.max_in_values.max(1)
    }

    /// Set the `max_cycles` option (builder pattern).
    #[must_use]
    pub fn max_cycles(mut self, value: usize) -> Self {
        self.max_cycles = value;
        self
    }
}
