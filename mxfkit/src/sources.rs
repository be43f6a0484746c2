//! Essence sources built over sub-parsers
//!
//! [`FileParser`] binds one sub-parser to a sequence of input files.
//! [`SequentialEssenceSource`] presents that set as a single essence
//! stream with monotonic positions across file boundaries.
//! [`RangedEssenceSource`] filters any source down to a sub-range,
//! keeping the pre-charge needed to decode the first requested unit.

use crate::essence::{EssenceSource, EssenceStreamDescriptor, EssenceSubParser, WrappingOption};
use crate::index_manager::SharedIndexManager;
use mxfkit_core::Rational;
use std::collections::VecDeque;
use std::io::{Read, Seek};
use tracing::{debug, error};

/// A sub-parser bound to an ordered set of input files
///
/// The parser owns its files: options, the edit rate and the index
/// manager binding are recorded so they can be re-applied when the set
/// advances to its next file.
pub struct FileParser<R: Read + Seek> {
    parser: Box<dyn EssenceSubParser>,
    current: Option<R>,
    pending: VecDeque<R>,
    stream: u32,
    wrapping: Option<WrappingOption>,
    options: Vec<(String, i64)>,
    edit_rate: Option<Rational>,
    manager: Option<(SharedIndexManager, usize)>,
}

impl<R: Read + Seek> FileParser<R> {
    /// Bind a parser to a set of files (at least one)
    pub fn new(parser: Box<dyn EssenceSubParser>, files: Vec<R>) -> Self {
        let mut pending: VecDeque<R> = files.into();
        let current = pending.pop_front();
        FileParser {
            parser,
            current,
            pending,
            stream: 0,
            wrapping: None,
            options: Vec::new(),
            edit_rate: None,
            manager: None,
        }
    }

    /// Identify the essence in the current (first) file
    pub fn identify(&mut self) -> std::io::Result<Vec<EssenceStreamDescriptor>> {
        match self.current.as_mut() {
            Some(file) => self.parser.identify_essence(file),
            None => Ok(Vec::new()),
        }
    }

    /// List the wrapping options for an identified stream
    pub fn wrapping_options(
        &mut self,
        descriptor: &EssenceStreamDescriptor,
    ) -> Vec<WrappingOption> {
        match self.current.as_mut() {
            Some(file) => self.parser.identify_wrapping_options(file, descriptor),
            None => Vec::new(),
        }
    }

    /// Select the stream and wrapping to read
    pub fn select_wrapping(&mut self, stream: u32, wrapping: &WrappingOption) {
        self.stream = stream;
        self.wrapping = Some(wrapping.clone());
        self.parser.use_wrapping(stream, wrapping);
    }

    /// The selected wrapping, if any
    pub fn wrapping(&self) -> Option<&WrappingOption> {
        self.wrapping.as_ref()
    }

    /// Set (and record) a parser option
    pub fn set_option(&mut self, name: &str, value: i64) -> bool {
        self.options.push((name.to_string(), value));
        self.parser.set_option(name, value)
    }

    /// Set (and record) the edit rate
    pub fn set_edit_rate(&mut self, rate: Rational) -> bool {
        if !self.parser.set_edit_rate(rate) {
            return false;
        }
        self.edit_rate = Some(rate);
        true
    }

    /// Bind (and record) the index manager
    pub fn set_index_manager(&mut self, manager: SharedIndexManager, stream_id: usize) {
        self.manager = Some((manager.clone(), stream_id));
        self.parser.set_index_manager(manager, stream_id);
    }

    /// The bound parser's selected edit rate
    pub fn edit_rate(&self) -> Rational {
        self.parser.edit_rate()
    }

    /// Position within the current file, in edit units
    pub fn position(&self) -> i64 {
        self.parser.current_position()
    }

    /// Size of the next wrapping unit in the current file (0 at its end)
    fn next_unit_size(&mut self) -> usize {
        let Some(file) = self.current.as_mut() else {
            return 0;
        };
        match self.parser.read_internal(file, self.stream, 1) {
            Ok(size) => size,
            Err(e) => {
                error!(error = %e, "essence scan failed");
                0
            }
        }
    }

    /// Read the next wrapping unit from the current file
    fn read_unit(&mut self) -> Option<Vec<u8>> {
        let file = self.current.as_mut()?;
        match self.parser.read(file, self.stream, 1) {
            Ok(data) if data.is_empty() => None,
            Ok(data) => Some(data),
            Err(e) => {
                error!(error = %e, "essence read failed");
                None
            }
        }
    }

    /// Move to the next file of the set, re-applying recorded state
    ///
    /// Returns false when the set is exhausted.
    fn advance(&mut self) -> bool {
        let Some(next) = self.pending.pop_front() else {
            self.current = None;
            return false;
        };

        debug!("advancing to the next file of the essence set");
        self.current = Some(next);
        self.parser.reset();

        if let Some(wrapping) = self.wrapping.clone() {
            self.parser.use_wrapping(self.stream, &wrapping);
        }
        if let Some(rate) = self.edit_rate {
            self.parser.set_edit_rate(rate);
        }
        for (name, value) in self.options.clone() {
            self.parser.set_option(&name, value);
        }
        if let Some((manager, stream_id)) = self.manager.clone() {
            self.parser.set_index_manager(manager, stream_id);
        }

        true
    }
}

/// Chains the files of a [`FileParser`] into one continuous source
///
/// Positions are monotonic across file boundaries: the length of each
/// finished file is added to the positions reported for the next.
pub struct SequentialEssenceSource<R: Read + Seek> {
    parser: FileParser<R>,
    previous_length: i64,
    bytes_remaining: usize,
    partial: Vec<u8>,
    ended: bool,
}

impl<R: Read + Seek> SequentialEssenceSource<R> {
    /// Wrap a configured file parser
    pub fn new(parser: FileParser<R>) -> Self {
        SequentialEssenceSource {
            parser,
            previous_length: 0,
            bytes_remaining: 0,
            partial: Vec::new(),
            ended: false,
        }
    }

    /// Access the wrapped file parser
    pub fn file_parser(&self) -> &FileParser<R> {
        &self.parser
    }

    /// Scan for the next unit, crossing file boundaries as needed
    fn scan_next(&mut self) -> usize {
        loop {
            let size = self.parser.next_unit_size();
            if size > 0 {
                return size;
            }
            // End of this file: bank its length and move on
            let finished = self.parser.position();
            if !self.parser.advance() {
                self.ended = true;
                return 0;
            }
            self.previous_length += finished;
        }
    }
}

impl<R: Read + Seek> EssenceSource for SequentialEssenceSource<R> {
    fn next_data_size(&mut self) -> usize {
        if self.bytes_remaining > 0 {
            return self.bytes_remaining;
        }
        if self.ended {
            return 0;
        }
        self.scan_next()
    }

    fn next_data(&mut self, size: usize, max_size: usize) -> Option<Vec<u8>> {
        if self.ended {
            return None;
        }

        if self.bytes_remaining == 0 {
            if self.scan_next() == 0 {
                return None;
            }
            let unit = self.parser.read_unit()?;

            if size == 0 && (max_size == 0 || unit.len() <= max_size) {
                return Some(unit);
            }

            // Caller wants less than the whole unit; hold the rest back
            let mut limit = unit.len();
            if max_size > 0 {
                limit = limit.min(max_size);
            }
            if size > 0 {
                limit = limit.min(size);
            }
            self.bytes_remaining = unit.len() - limit;
            self.partial = unit;
            let rest = self.partial.split_off(limit);
            let chunk = std::mem::replace(&mut self.partial, rest);
            return Some(chunk);
        }

        // Drain a held-back unit
        let mut limit = self.bytes_remaining;
        if max_size > 0 {
            limit = limit.min(max_size);
        }
        if size > 0 {
            limit = limit.min(size);
        }
        self.bytes_remaining -= limit;
        let rest = self.partial.split_off(limit);
        let chunk = std::mem::replace(&mut self.partial, rest);
        Some(chunk)
    }

    fn end_of_item(&self) -> bool {
        self.bytes_remaining == 0
    }

    fn end_of_data(&self) -> bool {
        self.ended
    }

    fn gc_essence_type(&self) -> u8 {
        self.parser
            .wrapping()
            .map(|w| w.gc_essence_type)
            .unwrap_or(0x15)
    }

    fn gc_element_type(&self) -> u8 {
        self.parser
            .wrapping()
            .map(|w| w.gc_element_type)
            .unwrap_or(0x05)
    }

    fn edit_rate(&self) -> Rational {
        self.parser.edit_rate()
    }

    fn current_position(&self) -> i64 {
        self.parser.position() + self.previous_length
    }

    fn can_index(&self) -> bool {
        true
    }

    fn set_index_manager(&mut self, manager: SharedIndexManager, stream_id: usize) {
        self.parser.set_index_manager(manager, stream_id);
    }

    fn set_option(&mut self, name: &str, value: i64) -> bool {
        self.parser.set_option(name, value)
    }

    fn ber_size(&self) -> usize {
        self.parser.wrapping().map(|w| w.ber_size).unwrap_or(0)
    }

    fn name(&self) -> &str {
        "sequential essence source"
    }
}

/// Filters a source down to `[start, end]` (or `start` plus a duration),
/// supplying the pre-charge needed to decode the first requested unit
pub struct RangedEssenceSource {
    base: Box<dyn EssenceSource>,
    requested_start: i64,
    requested_end: i64,
    requested_duration: i64,

    started: bool,
    ending: bool,
    ended: bool,

    pre_charge_start: i64,
    pre_charge: VecDeque<Vec<u8>>,
    delivered: i64,
}

impl RangedEssenceSource {
    /// Create a ranged view of `base`
    ///
    /// Pass `end` of -1 to use `duration`, or `duration` of -1 to use
    /// `end`; both -1 means "to the end of the stream".
    pub fn new(base: Box<dyn EssenceSource>, start: i64, end: i64, duration: i64) -> Self {
        RangedEssenceSource {
            base,
            requested_start: start,
            requested_end: end,
            requested_duration: duration,
            started: false,
            ending: false,
            ended: false,
            pre_charge_start: -1,
            pre_charge: VecDeque::new(),
            delivered: 0,
        }
    }

    /// Skip to the requested start, keeping units back to the last edit
    /// point as pre-charge
    fn locate_start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.pre_charge_start = 0;

        while self.base.current_position() < self.requested_start {
            let position = self.base.current_position();
            let size = self.base.next_data_size();
            if size == 0 {
                self.ended = true;
                return;
            }
            let Some(unit) = self.base.next_data(size, 0) else {
                self.ended = true;
                return;
            };

            // Decoding can restart at an edit point, so everything before
            // one is not needed as pre-charge
            if self.base.is_edit_point() {
                self.pre_charge.clear();
                self.pre_charge_start = position;
            }
            self.pre_charge.push_back(unit);
        }

        if self.pre_charge.is_empty() {
            self.pre_charge_start = self.requested_start;
        }
    }

    fn range_satisfied(&self) -> bool {
        if self.requested_duration >= 0 && self.delivered >= self.requested_duration {
            return true;
        }
        if self.requested_end >= 0 && self.base.current_position() > self.requested_end {
            return true;
        }
        false
    }
}

impl EssenceSource for RangedEssenceSource {
    fn next_data_size(&mut self) -> usize {
        self.locate_start();
        if let Some(front) = self.pre_charge.front() {
            return front.len();
        }
        if self.ended || (self.ending && self.base.end_of_item()) {
            return 0;
        }
        if self.range_satisfied() && self.base.end_of_item() {
            return 0;
        }
        self.base.next_data_size()
    }

    fn next_data(&mut self, size: usize, max_size: usize) -> Option<Vec<u8>> {
        self.locate_start();

        // Pre-charge drains first
        if let Some(unit) = self.pre_charge.pop_front() {
            return Some(unit);
        }

        if self.ended {
            return None;
        }

        // Once the range is satisfied, continue only to finish a part-
        // delivered wrapping unit
        if self.range_satisfied() && self.base.end_of_item() {
            self.ended = true;
            return None;
        }

        let chunk = self.base.next_data(size, max_size)?;
        if self.base.end_of_item() {
            self.delivered += 1;
            if self.range_satisfied() {
                self.ending = true;
            }
        }
        Some(chunk)
    }

    fn end_of_item(&self) -> bool {
        self.base.end_of_item()
    }

    fn end_of_data(&self) -> bool {
        self.ended || self.base.end_of_data()
    }

    fn gc_essence_type(&self) -> u8 {
        self.base.gc_essence_type()
    }

    fn gc_element_type(&self) -> u8 {
        self.base.gc_element_type()
    }

    fn edit_rate(&self) -> Rational {
        self.base.edit_rate()
    }

    fn current_position(&self) -> i64 {
        self.base.current_position() - self.requested_start
    }

    fn can_index(&self) -> bool {
        self.base.can_index()
    }

    fn set_index_manager(&mut self, manager: SharedIndexManager, stream_id: usize) {
        self.base.set_index_manager(manager, stream_id);
    }

    fn set_option(&mut self, name: &str, value: i64) -> bool {
        self.base.set_option(name, value)
    }

    /// Edit units of pre-charge ahead of the requested start
    fn precharge_size(&mut self) -> i64 {
        self.locate_start();
        self.requested_start - self.pre_charge_start
    }

    fn is_edit_point(&self) -> bool {
        self.base.is_edit_point()
    }

    fn name(&self) -> &str {
        "ranged essence source"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpeg2_ves::Mpeg2VesParser;
    use std::io::Cursor;

    fn ves_stream(pictures: usize) -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend([
            0x00, 0x00, 0x01, 0xB3, 0x28, 0x01, 0xE0, 0x23, 0xFF, 0xFF, 0xE0, 0x00,
        ]);
        stream.extend([0x00, 0x00, 0x01, 0xB8, 0x00, 0x08, 0x00, 0x40]);
        for i in 0..pictures {
            stream.extend([0x00, 0x00, 0x01, 0x00]);
            let data = ((i as u16) << 6) | (1 << 3); // all I pictures
            stream.push((data >> 8) as u8);
            stream.push(data as u8);
            stream.extend(std::iter::repeat(0x55).take(26));
        }
        // Space for the descriptor scan
        let len = stream.len().max(520);
        stream.resize(len, 0);
        stream
    }

    fn sequential(files: Vec<Vec<u8>>) -> SequentialEssenceSource<Cursor<Vec<u8>>> {
        let mut parser = FileParser::new(
            Box::new(Mpeg2VesParser::new()),
            files.into_iter().map(Cursor::new).collect(),
        );
        let descriptors = parser.identify().unwrap();
        assert!(!descriptors.is_empty());
        let options = parser.wrapping_options(&descriptors[0]);
        parser.select_wrapping(0, &options[0]);
        SequentialEssenceSource::new(parser)
    }

    #[test]
    fn positions_monotonic_across_files() {
        // Both files must be identical in format; each holds 3 pictures
        let mut source = sequential(vec![ves_stream(3), ves_stream(3)]);

        let mut positions = Vec::new();
        let mut units = 0;
        loop {
            let size = source.next_data_size();
            if size == 0 {
                break;
            }
            let unit = source.next_data(0, 0).unwrap();
            assert!(!unit.is_empty());
            units += 1;
            positions.push(source.current_position());
        }

        // The padding after the last picture of each file joins its final
        // edit unit, so each file yields its 3 pictures
        assert_eq!(units, 6);
        for pair in positions.windows(2) {
            assert!(pair[0] <= pair[1], "positions must not go backwards");
        }
        assert_eq!(*positions.last().unwrap(), 6);
        assert!(source.end_of_data());
    }

    #[test]
    fn ranged_source_collects_precharge() {
        struct UnitSource {
            units: Vec<(Vec<u8>, bool)>, // data, edit point
            position: usize,
        }
        impl EssenceSource for UnitSource {
            fn next_data_size(&mut self) -> usize {
                self.units.get(self.position).map(|u| u.0.len()).unwrap_or(0)
            }
            fn next_data(&mut self, _size: usize, _max: usize) -> Option<Vec<u8>> {
                let unit = self.units.get(self.position)?;
                self.position += 1;
                Some(unit.0.clone())
            }
            fn end_of_item(&self) -> bool {
                true
            }
            fn end_of_data(&self) -> bool {
                self.position >= self.units.len()
            }
            fn is_edit_point(&self) -> bool {
                self.position > 0 && self.units[self.position - 1].1
            }
            fn gc_essence_type(&self) -> u8 {
                0x15
            }
            fn gc_element_type(&self) -> u8 {
                0x05
            }
            fn edit_rate(&self) -> Rational {
                Rational::new(25, 1)
            }
            fn current_position(&self) -> i64 {
                self.position as i64
            }
        }

        // Edit points at units 0 and 3; range starts at unit 5
        let base = UnitSource {
            units: vec![
                (vec![0], true),
                (vec![1], false),
                (vec![2], false),
                (vec![3], true),
                (vec![4], false),
                (vec![5], false),
                (vec![6], false),
                (vec![7], false),
            ],
            position: 0,
        };

        let mut ranged = RangedEssenceSource::new(Box::new(base), 5, -1, 2);

        // Pre-charge reaches back to the edit point at unit 3
        assert_eq!(ranged.precharge_size(), 2);

        let mut yielded = Vec::new();
        while let Some(unit) = ranged.next_data(0, 0) {
            yielded.push(unit[0]);
        }

        // Units 3 and 4 are pre-charge, 5 and 6 are the range
        assert_eq!(yielded, vec![3, 4, 5, 6]);
        assert!(ranged.end_of_data());
    }
}
