use std::fmt::{self, Display, Formatter};

/// The number identifying an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OptionNumber(pub u16);

impl OptionNumber {
    pub const IF_MATCH: OptionNumber = OptionNumber(1);
    pub const URI_HOST: OptionNumber = OptionNumber(3);
    pub const ETAG: OptionNumber = OptionNumber(4);
    pub const IF_NONE_MATCH: OptionNumber = OptionNumber(5);
    pub const URI_PORT: OptionNumber = OptionNumber(7);
    pub const LOCATION_PATH: OptionNumber = OptionNumber(8);
    pub const URI_PATH: OptionNumber = OptionNumber(11);
    pub const CONTENT_FORMAT: OptionNumber = OptionNumber(12);
    pub const MAX_AGE: OptionNumber = OptionNumber(14);
    pub const URI_QUERY: OptionNumber = OptionNumber(15);
    pub const ACCEPT: OptionNumber = OptionNumber(17);
    pub const LOCATION_QUERY: OptionNumber = OptionNumber(20);
    pub const BLOCK2: OptionNumber = OptionNumber(23);
    pub const BLOCK1: OptionNumber = OptionNumber(27);
    pub const SIZE2: OptionNumber = OptionNumber(28);
    pub const PROXY_URI: OptionNumber = OptionNumber(35);
    pub const PROXY_SCHEME: OptionNumber = OptionNumber(39);
    pub const SIZE1: OptionNumber = OptionNumber(60);

    /// Critical options must be understood by the recipient.
    pub const fn is_critical(self) -> bool {
        self.0 & 1 == 1
    }

    /// Whether the option is one this crate knows how to process.
    pub const fn is_recognized(self) -> bool {
        matches!(
            self.0,
            1 | 3 | 4 | 5 | 7 | 8 | 11 | 12 | 14 | 15 | 17 | 20 | 23 | 27 | 28 | 35 | 39 | 60
        )
    }

    /// Unsafe options must be understood by a proxy before forwarding.
    pub const fn is_unsafe(self) -> bool {
        self.0 & 2 == 2
    }

    /// Whether this option addresses the resource rather than describing the
    /// request, and so is rewritten when a proxy picks a new target.
    pub const fn is_routing(self) -> bool {
        matches!(self.0, 3 | 7 | 11 | 15 | 35 | 39)
    }

    /// Block options and their size indications only describe a single hop.
    pub const fn is_hop_by_hop(self) -> bool {
        matches!(self.0, 23 | 27 | 28 | 60)
    }
}

impl Display for OptionNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single option instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoapOption {
    pub number: OptionNumber,
    pub value: Vec<u8>,
}

/// The options of a message: an ordered multimap from option number to
/// values. Options stay sorted by number, and repeated options keep the order
/// in which they were added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(Vec<CoapOption>);

impl Options {
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends a value for `number` after any existing values for it.
    pub fn push(&mut self, number: OptionNumber, value: impl Into<Vec<u8>>) {
        let index = self.0.partition_point(|option| option.number <= number);
        self.0.insert(
            index,
            CoapOption {
                number,
                value: value.into(),
            },
        );
    }

    /// Replaces every value for `number` with the single given value.
    pub fn set(&mut self, number: OptionNumber, value: impl Into<Vec<u8>>) {
        self.remove(number);
        self.push(number, value);
    }

    /// Removes every value for `number`.
    pub fn remove(&mut self, number: OptionNumber) {
        self.0.retain(|option| option.number != number);
    }

    /// The first value for `number`.
    pub fn get(&self, number: OptionNumber) -> Option<&[u8]> {
        self.get_all(number).next()
    }

    pub fn get_all(&self, number: OptionNumber) -> impl Iterator<Item = &[u8]> {
        self.0
            .iter()
            .filter(move |option| option.number == number)
            .map(|option| option.value.as_slice())
    }

    pub fn contains(&self, number: OptionNumber) -> bool {
        self.get(number).is_some()
    }

    /// The first value for `number` decoded as a big-endian unsigned integer.
    /// Values longer than four bytes do not fit and yield `None`.
    pub fn get_uint(&self, number: OptionNumber) -> Option<u32> {
        let value = self.get(number)?;
        if value.len() > 4 {
            return None;
        }
        Some(value.iter().fold(0u32, |acc, byte| (acc << 8) | *byte as u32))
    }

    /// Sets `number` to the shortest big-endian encoding of `value`.
    pub fn set_uint(&mut self, number: OptionNumber, value: u32) {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|byte| **byte == 0).count();
        self.set(number, bytes[skip..].to_vec());
    }

    /// The first value for `number` as UTF-8 text.
    pub fn get_str(&self, number: OptionNumber) -> Option<&str> {
        std::str::from_utf8(self.get(number)?).ok()
    }

    /// The first critical option that is not recognized. A message carrying
    /// one must not be processed.
    pub fn unrecognized_critical(&self) -> Option<OptionNumber> {
        self.0
            .iter()
            .map(|option| option.number)
            .find(|number| number.is_critical() && !number.is_recognized())
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoapOption> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<CoapOption> for Options {
    fn from_iter<T: IntoIterator<Item = CoapOption>>(iter: T) -> Self {
        let mut options = Options::new();
        for option in iter {
            options.push(option.number, option.value);
        }
        options
    }
}
