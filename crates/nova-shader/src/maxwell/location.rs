/// Byte address of an instruction, relative to the program base.
///
/// Code comes in 32-byte bundles whose first word carries scheduling information, so an address
/// that is a multiple of 32 never holds an instruction; stepping skips those words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location(u32);

impl Location {
    pub const INSTRUCTION_SIZE: u32 = 8;
    const BUNDLE_SIZE: u32 = 32;

    /// Creates a location, moving off a scheduling word onto the first instruction after it.
    pub fn new(offset: u32) -> Self {
        let offset = offset & !(Self::INSTRUCTION_SIZE - 1);
        if offset.is_multiple_of(Self::BUNDLE_SIZE) {
            Self(offset + Self::INSTRUCTION_SIZE)
        } else {
            Self(offset)
        }
    }

    /// Creates a location only if `offset` addresses an instruction.
    pub fn exact(offset: u32) -> Option<Self> {
        let aligned = offset.is_multiple_of(Self::INSTRUCTION_SIZE);
        (aligned && !offset.is_multiple_of(Self::BUNDLE_SIZE)).then_some(Self(offset))
    }

    pub fn offset(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Self {
        let mut offset = self.0 + Self::INSTRUCTION_SIZE;
        if offset.is_multiple_of(Self::BUNDLE_SIZE) {
            offset += Self::INSTRUCTION_SIZE;
        }
        Self(offset)
    }

    pub fn prev(self) -> Self {
        let mut offset = self.0.saturating_sub(Self::INSTRUCTION_SIZE);
        if offset.is_multiple_of(Self::BUNDLE_SIZE) {
            offset = offset.saturating_sub(Self::INSTRUCTION_SIZE);
        }
        Self(offset)
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stepping_skips_scheduling_words() {
        let start = Location::new(0);
        assert_eq!(start.offset(), 8);
        let offsets: Vec<u32> = std::iter::successors(Some(start), |loc| Some(loc.next()))
            .take(5)
            .map(Location::offset)
            .collect();
        assert_eq!(offsets, [8, 16, 24, 40, 48]);
        assert_eq!(Location::new(40).prev().offset(), 24);
    }

    #[test]
    fn exact_rejects_scheduling_words() {
        assert!(Location::exact(32).is_none());
        assert!(Location::exact(12).is_none());
        assert_eq!(Location::exact(16).map(Location::offset), Some(16));
    }
}
