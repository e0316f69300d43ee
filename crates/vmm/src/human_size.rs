use core::fmt;

/// Wraps a [`usize`] byte count to provide a human-readable display format.
///
/// ## Example
///
/// ```
/// use vmm::HumanSize;
///
/// let size = HumanSize::from(2 * 1024 * 1024);
/// assert_eq!(format!("{size}"), "2.0MiB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumanSize(pub usize);

impl HumanSize {
    pub const fn new(size: usize) -> Self {
        Self(size)
    }
}

impl From<usize> for HumanSize {
    fn from(size: usize) -> Self {
        Self(size)
    }
}

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
        const THRESHOLD: f64 = 1024.0;

        let mut size = self.0 as f64;
        for (index, unit) in UNITS.iter().enumerate() {
            if size < THRESHOLD || index == UNITS.len() - 1 {
                return if index == 0 {
                    // Whole bytes never need a fraction.
                    write!(f, "{}{}", self.0, unit)
                } else {
                    write!(f, "{size:.1}{unit}")
                };
            }
            size /= THRESHOLD;
        }
        unreachable!()
    }
}
