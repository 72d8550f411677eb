use thiserror::Error;

/// Reserved type byte used only to separate two consecutive items of the same type.
pub const SEPARATOR: u8 = 0;

/// Longest value a single encoded item (or fragment) may carry.
pub const MAX_FRAGMENT_LEN: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TlvError {
    #[error("invalid tlv encoded buffer: too short")]
    TooShort,
    #[error("invalid tlv encoded buffer: no separator between two items")]
    NoSeparator,
    #[error("invalid tlv encoded buffer: bad fragment")]
    BadFragment,
    #[error("invalid tlv encoded buffer: out of bounds due to bad length field")]
    OutOfBounds,
    #[error("invalid tlv encoded buffer: fragment item invalid length")]
    FragmentItemInvalidLength,
}

/// A single logical `(type, value)` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub kind: u8,
    pub value: Vec<u8>,
}

/// Ordered multiset of TLV items.
///
/// Duplicate types are allowed and insertion order is preserved, which keeps
/// [`Container::to_bytes`] deterministic. Values longer than
/// [`MAX_FRAGMENT_LEN`] are split into fragments on encode and stitched back
/// together on parse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Container {
    items: Vec<Item>,
}

impl Container {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Append an item. The separator type is reserved and silently skipped.
    pub fn set(&mut self, kind: u8, value: impl Into<Vec<u8>>) {
        debug_assert_ne!(kind, SEPARATOR, "tlv type 0 is reserved");
        if kind == SEPARATOR {
            return;
        }
        self.items.push(Item {
            kind,
            value: value.into(),
        });
    }

    pub fn set_byte(&mut self, kind: u8, value: u8) {
        self.set(kind, [value]);
    }

    /// Append a nested container under `kind`.
    pub fn set_container(&mut self, kind: u8, nested: &Container) {
        self.set(kind, nested.to_bytes());
    }

    /// Value of the first item with the given type.
    pub fn get(&self, kind: u8) -> Option<&[u8]> {
        self.items
            .iter()
            .find(|item| item.kind == kind)
            .map(|item| item.value.as_slice())
    }

    pub fn get_byte(&self, kind: u8) -> Option<u8> {
        self.get(kind).and_then(|value| value.first().copied())
    }

    /// Parse the first item of type `kind` as a nested container.
    pub fn get_container(&self, kind: u8) -> Option<Result<Container, TlvError>> {
        self.get(kind).map(Container::parse)
    }

    /// Remove the first item with the given type, returning its value.
    pub fn remove(&mut self, kind: u8) -> Option<Vec<u8>> {
        let idx = self.items.iter().position(|item| item.kind == kind)?;
        Some(self.items.remove(idx).value)
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Encode the container in insertion order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len_hint());
        let mut previous = SEPARATOR;
        for item in &self.items {
            if previous == item.kind {
                out.push(SEPARATOR);
            }
            if item.value.is_empty() {
                out.extend_from_slice(&[item.kind, 0]);
            } else {
                for chunk in item.value.chunks(MAX_FRAGMENT_LEN) {
                    out.push(item.kind);
                    out.push(chunk.len() as u8);
                    out.extend_from_slice(chunk);
                }
            }
            previous = item.kind;
        }
        out
    }

    fn encoded_len_hint(&self) -> usize {
        self.items
            .iter()
            .map(|item| item.value.len() + 3 + 2 * (item.value.len() / MAX_FRAGMENT_LEN))
            .sum()
    }

    /// Decode a buffer produced by [`Container::to_bytes`].
    pub fn parse(buf: &[u8]) -> Result<Self, TlvError> {
        if buf.len() < 2 {
            return match buf {
                [] | [SEPARATOR] => Ok(Self::new()),
                _ => Err(TlvError::TooShort),
            };
        }

        let mut items: Vec<Item> = Vec::with_capacity(8);
        // Type and length of the previously parsed chunk; `None` after a separator.
        let mut previous: Option<(u8, usize)> = None;
        let mut in_fragment = false;
        let mut i = 0;

        while i < buf.len() {
            let kind = buf[i];
            if kind == SEPARATOR {
                previous = None;
                in_fragment = false;
                i += 1;
                continue;
            }
            if i + 1 >= buf.len() {
                return Err(TlvError::TooShort);
            }

            match previous {
                Some((prev_kind, prev_len)) if prev_kind == kind => {
                    if prev_len != MAX_FRAGMENT_LEN {
                        return Err(if in_fragment {
                            TlvError::BadFragment
                        } else {
                            TlvError::NoSeparator
                        });
                    }
                    in_fragment = true;
                }
                _ => in_fragment = false,
            }

            let len = buf[i + 1] as usize;
            let start = i + 2;
            let end = start + len;
            if end > buf.len() {
                return Err(TlvError::OutOfBounds);
            }
            if len == 0 && in_fragment {
                return Err(TlvError::FragmentItemInvalidLength);
            }

            let chunk = &buf[start..end];
            match items.last_mut() {
                Some(last) if in_fragment => last.value.extend_from_slice(chunk),
                _ => items.push(Item {
                    kind,
                    value: chunk.to_vec(),
                }),
            }

            previous = Some((kind, len));
            i = end;
        }

        Ok(Self { items })
    }
}

impl FromIterator<(u8, Vec<u8>)> for Container {
    fn from_iter<I: IntoIterator<Item = (u8, Vec<u8>)>>(iter: I) -> Self {
        let mut container = Container::new();
        for (kind, value) in iter {
            container.set(kind, value);
        }
        container
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_in_insertion_order() {
        let mut c = Container::new();
        c.set(2, [0xAA, 0xBB]);
        c.set_byte(1, 0x01);
        assert_eq!(c.to_bytes(), vec![2, 2, 0xAA, 0xBB, 1, 1, 0x01]);
    }

    #[test]
    fn zero_length_item_encodes_as_type_and_zero() {
        let mut c = Container::new();
        c.set(7, Vec::new());
        assert_eq!(c.to_bytes(), vec![7, 0]);
        let parsed = Container::parse(&[7, 0]).expect("parse");
        assert_eq!(parsed.get(7), Some(&[][..]));
    }

    #[test]
    fn duplicate_types_get_a_separator() {
        let mut c = Container::new();
        c.set_byte(3, 1);
        c.set_byte(3, 2);
        let encoded = c.to_bytes();
        assert_eq!(encoded, vec![3, 1, 1, 0, 3, 1, 2]);

        let parsed = Container::parse(&encoded).expect("parse");
        assert_eq!(parsed, c);
        assert_eq!(parsed.get_byte(3), Some(1));
    }

    #[test]
    fn missing_separator_is_rejected() {
        let err = Container::parse(&[3, 1, 1, 3, 1, 2]).unwrap_err();
        assert_eq!(err, TlvError::NoSeparator);
    }

    #[test]
    fn long_values_fragment_and_reassemble() {
        let value: Vec<u8> = (0..600u32).map(|v| v as u8).collect();
        let mut c = Container::new();
        c.set(9, value.clone());
        c.set_byte(4, 0xFF);
        let encoded = c.to_bytes();

        assert_eq!(encoded[0], 9);
        assert_eq!(encoded[1], 255);
        assert_eq!(encoded[257], 9);
        assert_eq!(encoded[258], 255);
        assert_eq!(encoded[514], 9);
        assert_eq!(encoded[515], 90);

        let parsed = Container::parse(&encoded).expect("parse");
        assert_eq!(parsed.get(9), Some(value.as_slice()));
        assert_eq!(parsed.get_byte(4), Some(0xFF));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn exact_fragment_boundary_then_duplicate_type() {
        let mut c = Container::new();
        c.set(5, vec![1u8; 255]);
        c.set(5, vec![2u8; 3]);
        let parsed = Container::parse(&c.to_bytes()).expect("parse");
        assert_eq!(parsed, c);
    }

    #[test]
    fn short_fragment_followed_by_same_type_is_bad_fragment() {
        let mut buf = vec![6, 255];
        buf.extend(std::iter::repeat(0x11).take(255));
        buf.extend([6, 2, 0x22, 0x22]);
        buf.extend([6, 1, 0x33]);
        assert_eq!(Container::parse(&buf).unwrap_err(), TlvError::BadFragment);
    }

    #[test]
    fn empty_fragment_continuation_is_rejected() {
        let mut buf = vec![6, 255];
        buf.extend(std::iter::repeat(0x11).take(255));
        buf.extend([6, 0]);
        assert_eq!(
            Container::parse(&buf).unwrap_err(),
            TlvError::FragmentItemInvalidLength
        );
    }

    #[test]
    fn length_overrun_is_out_of_bounds() {
        assert_eq!(
            Container::parse(&[1, 4, 0xAA]).unwrap_err(),
            TlvError::OutOfBounds
        );
    }

    #[test]
    fn short_inputs() {
        assert!(Container::parse(&[]).expect("empty").is_empty());
        assert!(Container::parse(&[0]).expect("separator").is_empty());
        assert_eq!(Container::parse(&[4]).unwrap_err(), TlvError::TooShort);
        assert_eq!(Container::parse(&[4, 0, 5]).unwrap_err(), TlvError::TooShort);
    }

    #[test]
    fn trailing_type_byte_without_length_is_rejected() {
        let mut c = Container::new();
        c.set(2, [0xAA, 0xBB]);
        c.set_byte(3, 6);
        let mut buf = c.to_bytes();

        buf.push(SEPARATOR);
        assert_eq!(Container::parse(&buf).expect("trailing separator"), c);

        buf.push(9);
        assert_eq!(Container::parse(&buf).unwrap_err(), TlvError::TooShort);
    }

    #[test]
    fn remove_and_get_touch_first_match() {
        let mut c = Container::new();
        c.set_byte(1, 10);
        c.set_byte(2, 20);
        c.set_byte(1, 11);
        assert_eq!(c.remove(1), Some(vec![10]));
        assert_eq!(c.get_byte(1), Some(11));
        assert_eq!(c.remove(8), None);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn nested_containers() {
        let mut inner = Container::new();
        inner.set_byte(1, 6);
        let mut outer = Container::new();
        outer.set_container(12, &inner);
        let parsed = Container::parse(&outer.to_bytes()).expect("outer");
        let nested = parsed.get_container(12).expect("present").expect("inner");
        assert_eq!(nested, inner);
    }

    #[test]
    fn fuzz_parse_never_panics() {
        let mut seed: u64 = 0x0511_2018;
        fn lcg_next(s: &mut u64) -> u8 {
            *s = s.wrapping_mul(6364136223846793005u64).wrapping_add(1);
            (*s >> 32) as u8
        }

        for len in 0..512usize {
            let buf: Vec<u8> = (0..len).map(|_| lcg_next(&mut seed)).collect();
            let res = std::panic::catch_unwind(|| Container::parse(&buf));
            assert!(res.is_ok(), "parse panicked on buffer length={len}");
        }
    }
}
