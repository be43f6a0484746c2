//! Content package interleave validation
//!
//! While reading a Generic Container, each content package should repeat
//! the same ordered sequence of element kinds. [`GcLayout`] learns the
//! layout from the first complete content package and reports where in
//! the cycle each subsequent element falls, flagging deviations without
//! aborting the parse.

use mxfkit_core::GcElementKind;

/// Result of offering an element to the layout tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutOffer {
    /// The element does not fit the learned layout
    Inconsistent,
    /// Added within the current content package
    Added,
    /// Added; the next element should be the last of the package
    Penultimate,
    /// Added as the last element of the package
    Terminal,
    /// This element starts a new content package
    StartsNew,
}

/// Position within the learned layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutPlace {
    /// No layout has been learned yet
    Unknown,
    /// Somewhere in the middle of a package
    Middle,
    /// The next element will be the last
    Penultimate,
    /// At the end of a package
    Terminal,
    /// A package has just started
    JustStarted,
}

/// Tracks the per-content-package element layout of one container
#[derive(Debug, Clone)]
pub struct GcLayout {
    current: Vec<GcElementKind>,
    fresh: Vec<GcElementKind>,
    valid: bool,
    inconsistent: bool,
    autorefresh: bool,
    pos: i64,
}

impl Default for GcLayout {
    fn default() -> Self {
        Self::new(true)
    }
}

impl GcLayout {
    /// Create a tracker; with `autorefresh` the learned layout is
    /// replaced by the most recent complete package at each cycle start
    pub fn new(autorefresh: bool) -> Self {
        GcLayout {
            current: Vec::with_capacity(16),
            fresh: Vec::with_capacity(16),
            valid: false,
            inconsistent: false,
            autorefresh,
            pos: 0,
        }
    }

    /// Has a layout been learned?
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Has every offered element matched the learned layout?
    pub fn is_consistent(&self) -> bool {
        !self.inconsistent
    }

    /// Count of complete content packages seen since the last reset
    pub fn pos(&self) -> i64 {
        self.pos
    }

    /// The most recently offered element
    pub fn last(&self) -> Option<GcElementKind> {
        self.fresh.last().copied()
    }

    /// Elements per content package in the learned (or building) layout
    pub fn len(&self) -> usize {
        if self.valid {
            self.current.len()
        } else {
            self.fresh.len()
        }
    }

    /// True when nothing has been offered yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget the learned layout and start again
    pub fn reset(&mut self, autorefresh: bool) {
        self.valid = false;
        self.inconsistent = false;
        self.autorefresh = autorefresh;
        self.pos = 0;
        self.current.clear();
        self.fresh.clear();
    }

    /// Offer the next element read from the container
    pub fn offer(&mut self, kind: GcElementKind) -> LayoutOffer {
        if !self.valid {
            return self.offer_learning(kind);
        }

        if !self.current.is_empty() && kind == self.current[0] {
            self.start_new(kind);
            return LayoutOffer::StartsNew;
        }

        self.fresh.push(kind);

        if self.fresh.len() > self.current.len() {
            self.inconsistent = true;
            return LayoutOffer::Inconsistent;
        }

        let expected = self.current[self.fresh.len() - 1];
        if kind != expected {
            self.inconsistent = true;
            return LayoutOffer::Inconsistent;
        }

        if self.fresh.len() == self.current.len() {
            LayoutOffer::Terminal
        } else if self.fresh.len() == self.current.len() - 1 {
            LayoutOffer::Penultimate
        } else {
            LayoutOffer::Added
        }
    }

    fn offer_learning(&mut self, kind: GcElementKind) -> LayoutOffer {
        if self.fresh.is_empty() {
            self.fresh.push(kind);
            return LayoutOffer::StartsNew;
        }

        let repeats_cycle = (self.fresh.len() == 1 && kind == *self.fresh.last().unwrap())
            || (self.fresh.len() > 1 && kind == self.fresh[0]);
        if repeats_cycle {
            if self.autorefresh {
                self.current = self.fresh.clone();
                self.valid = true;
                self.inconsistent = false;
            }
            self.start_new(kind);
            return LayoutOffer::StartsNew;
        }

        // Until a full cycle is seen, item classes must not decrease,
        // except that picture/sound/compound may follow data
        let last_class = self.fresh.last().unwrap().item & 0x0F;
        let this_class = kind.item & 0x0F;
        if (this_class > 4 && last_class == 7) || this_class >= last_class {
            self.fresh.push(kind);
            return LayoutOffer::Added;
        }

        // The sequence wrapped without repeating the first element
        if self.autorefresh {
            self.current = self.fresh.clone();
            self.valid = true;
            self.inconsistent = false;
        }
        self.start_new(kind);
        LayoutOffer::StartsNew
    }

    fn start_new(&mut self, kind: GcElementKind) {
        self.fresh.clear();
        self.fresh.push(kind);
        self.pos += 1;
    }

    /// Where the tracker currently sits within the learned layout
    pub fn place(&self) -> LayoutPlace {
        if !self.valid || self.current.is_empty() {
            return LayoutPlace::Unknown;
        }

        if self.fresh.len() == self.current.len() {
            LayoutPlace::Terminal
        } else if self.fresh.len() == self.current.len() - 1 {
            LayoutPlace::Penultimate
        } else if self.fresh.len() == 1 {
            LayoutPlace::JustStarted
        } else {
            LayoutPlace::Middle
        }
    }

    /// Force the building layout to be adopted as complete
    ///
    /// Returns [`LayoutOffer::Terminal`] when the tracker was at the end
    /// of a package, [`LayoutOffer::Inconsistent`] otherwise.
    pub fn force_end(&mut self) -> LayoutOffer {
        self.current = self.fresh.clone();
        self.inconsistent = false;
        self.fresh.clear();

        // With fresh cleared the place test reports Terminal only when a
        // zero-length fresh list matches, so compare sizes directly
        if self.current.is_empty() {
            return LayoutOffer::Inconsistent;
        }
        self.valid = true;
        LayoutOffer::Terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(item: u8, number: u8) -> GcElementKind {
        GcElementKind {
            item,
            count: 1,
            element_type: 0x05,
            number,
        }
    }

    #[test]
    fn learns_and_tracks_cycle() {
        let mut layout = GcLayout::default();

        // First package: picture then two sounds
        assert_eq!(layout.offer(kind(0x15, 1)), LayoutOffer::StartsNew);
        assert_eq!(layout.offer(kind(0x16, 1)), LayoutOffer::Added);
        assert_eq!(layout.offer(kind(0x16, 2)), LayoutOffer::Added);
        assert!(!layout.is_valid());

        // Repeat of the first element closes the learning cycle
        assert_eq!(layout.offer(kind(0x15, 1)), LayoutOffer::StartsNew);
        assert!(layout.is_valid());
        assert_eq!(layout.len(), 3);
        assert_eq!(layout.pos(), 1);

        assert_eq!(layout.offer(kind(0x16, 1)), LayoutOffer::Penultimate);
        assert_eq!(layout.offer(kind(0x16, 2)), LayoutOffer::Terminal);
        assert_eq!(layout.place(), LayoutPlace::Terminal);

        // Exactly one StartsNew per content package
        assert_eq!(layout.offer(kind(0x15, 1)), LayoutOffer::StartsNew);
        assert_eq!(layout.pos(), 2);
    }

    #[test]
    fn detects_inconsistency_without_aborting() {
        let mut layout = GcLayout::default();
        layout.offer(kind(0x15, 1));
        layout.offer(kind(0x16, 1));
        layout.offer(kind(0x15, 1)); // learn 2-element cycle

        // A data element where a sound should be
        assert_eq!(layout.offer(kind(0x17, 1)), LayoutOffer::Inconsistent);
        assert!(!layout.is_consistent());

        // Tracking continues: the next picture starts a new package
        assert_eq!(layout.offer(kind(0x15, 1)), LayoutOffer::StartsNew);
    }

    #[test]
    fn picture_may_follow_data_while_learning() {
        let mut layout = GcLayout::default();
        layout.offer(kind(0x17, 1)); // data first
        // Picture after data is allowed by the learning rule
        assert_eq!(layout.offer(kind(0x15, 1)), LayoutOffer::Added);
    }

    #[test]
    fn single_element_cycle() {
        let mut layout = GcLayout::default();
        assert_eq!(layout.offer(kind(0x15, 1)), LayoutOffer::StartsNew);
        // The same element again is a one-element cycle
        assert_eq!(layout.offer(kind(0x15, 1)), LayoutOffer::StartsNew);
        assert!(layout.is_valid());
        assert_eq!(layout.len(), 1);
    }

    #[test]
    fn force_end_adopts_layout() {
        let mut layout = GcLayout::default();
        layout.offer(kind(0x15, 1));
        layout.offer(kind(0x16, 1));
        assert_eq!(layout.force_end(), LayoutOffer::Terminal);
        assert!(layout.is_valid());
        assert_eq!(layout.len(), 2);

        let mut empty = GcLayout::default();
        assert_eq!(empty.force_end(), LayoutOffer::Inconsistent);
    }
}
