//! Conversion between [`ParameterSet`] and the fixed-record typed parameter
//! array exchanged with the subsystem.
//!
//! [`RawTypedParam`] has the exact layout of libvirt's `virTypedParameter`,
//! so a [`RawParams`] buffer can be handed to the C API as is.

use std::{
    convert::TryFrom,
    ffi::{CStr, CString},
    ops::RangeFrom,
    os::raw::{c_char, c_int, c_longlong, c_uint, c_ulonglong},
    ptr,
};

use log::debug;

use crate::{
    error::{Error, Result},
    params::ParameterSet,
    typed::{ParamKind, ParamValue, TypedValue},
};

/// Size of the name field, NUL terminator included.
pub const FIELD_LENGTH: usize = 80;

#[repr(C)]
#[derive(Clone, Copy)]
pub union RawValue {
    pub i: c_int,
    pub ui: c_uint,
    pub l: c_longlong,
    pub ul: c_ulonglong,
    pub d: f64,
    pub b: c_char,
    pub s: *mut c_char,
}

#[repr(C)]
pub struct RawTypedParam {
    pub field: [c_char; FIELD_LENGTH],
    pub kind: c_int,
    pub value: RawValue,
}

impl Default for RawTypedParam {
    fn default() -> Self {
        Self {
            field: [0; FIELD_LENGTH],
            kind: 0,
            value: RawValue { ul: 0 },
        }
    }
}

fn decode_err(index: usize, reason: impl Into<String>) -> Error {
    Error::Decode {
        index,
        reason: reason.into(),
    }
}

impl RawTypedParam {
    /// Build a record whose string payload, if any, is a fresh `CString`
    /// that the holding [`RawParams`] must release.
    fn owned(name: &str, value: &ParamValue) -> Result<Self> {
        let mut record = RawTypedParam::default();
        record.set_name(name)?;
        record.kind = value.kind().tag();
        record.value = match value {
            ParamValue::Int32(v) => RawValue { i: *v },
            ParamValue::UInt32(v) => RawValue { ui: *v },
            ParamValue::Int64(v) => RawValue { l: *v },
            ParamValue::UInt64(v) => RawValue { ul: *v },
            ParamValue::Double(v) => RawValue { d: *v },
            ParamValue::Boolean(v) => RawValue { b: c_char::from(*v) },
            ParamValue::String(s) => {
                let s = CString::new(s.as_str())
                    .map_err(|_| Error::invalid(name, "string value contains a NUL byte"))?;
                RawValue { s: s.into_raw() }
            }
        };
        Ok(record)
    }

    pub(crate) fn set_name(&mut self, name: &str) -> Result<()> {
        let bytes = name.as_bytes();
        if bytes.is_empty() {
            return Err(Error::invalid(name, "empty name"));
        }
        if bytes.len() >= FIELD_LENGTH {
            return Err(Error::NameTooLong {
                name: name.to_owned(),
                len: bytes.len(),
                max: FIELD_LENGTH - 1,
            });
        }
        if bytes.contains(&0) {
            return Err(Error::invalid(name, "name contains a NUL byte"));
        }

        for (dst, src) in self.field.iter_mut().zip(bytes) {
            *dst = *src as c_char;
        }
        self.field[bytes.len()..].fill(0);
        Ok(())
    }

    /// Name bytes up to the terminator, `None` if the field is unterminated.
    pub fn name_bytes(&self) -> Option<&[u8]> {
        // c_char and u8 share size and alignment
        let bytes = unsafe {
            &*(&self.field as *const [c_char; FIELD_LENGTH] as *const [u8; FIELD_LENGTH])
        };
        bytes.iter().position(|b| *b == 0).map(|end| &bytes[..end])
    }

    fn is_string(&self) -> bool {
        self.kind == ParamKind::String.tag()
    }

    /// Copy the record out. The record is left untouched.
    pub fn read(&self, index: usize) -> Result<TypedValue> {
        let name = self
            .name_bytes()
            .ok_or_else(|| decode_err(index, "name is not NUL terminated"))?;
        let name = std::str::from_utf8(name)
            .map_err(|_| decode_err(index, "name is not valid UTF-8"))?
            .to_owned();
        let kind = ParamKind::try_from(self.kind)
            .map_err(|tag| decode_err(index, format!("unknown type tag {tag} for {name:?}")))?;

        // The tag selects the active union arm.
        let value = unsafe {
            match kind {
                ParamKind::Int32 => ParamValue::Int32(self.value.i),
                ParamKind::UInt32 => ParamValue::UInt32(self.value.ui),
                ParamKind::Int64 => ParamValue::Int64(self.value.l),
                ParamKind::UInt64 => ParamValue::UInt64(self.value.ul),
                ParamKind::Double => ParamValue::Double(self.value.d),
                ParamKind::Boolean => ParamValue::Boolean(self.value.b != 0),
                ParamKind::String => {
                    let s = self.value.s;
                    if s.is_null() {
                        return Err(decode_err(index, format!("null string payload for {name:?}")));
                    }
                    let s = CStr::from_ptr(s).to_str().map_err(|_| {
                        decode_err(index, format!("string value of {name:?} is not UTF-8"))
                    })?;
                    ParamValue::String(s.to_owned())
                }
            }
        };

        Ok(TypedValue { name, value })
    }
}

/// Releases the string payloads of `len` records starting at the pointer.
pub type ReleaseFn = unsafe fn(*mut RawTypedParam, usize);

#[derive(Clone, Copy)]
enum Strings {
    Owned,
    Foreign(ReleaseFn),
}

/// Owned array of raw records.
///
/// String payloads are released when records are truncated away or the
/// buffer is dropped, either as `CString`s allocated here or through the
/// subsystem's release function after [`RawParams::adopt_foreign`].
pub struct RawParams {
    records: Vec<RawTypedParam>,
    strings: Strings,
}

unsafe fn release_owned(record: &mut RawTypedParam) {
    if record.is_string() && !record.value.s.is_null() {
        drop(CString::from_raw(record.value.s));
        record.value.s = ptr::null_mut();
    }
}

impl RawParams {
    pub fn zeroed(len: usize) -> Self {
        Self {
            records: (0..len).map(|_| RawTypedParam::default()).collect(),
            strings: Strings::Owned,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[RawTypedParam] {
        &self.records
    }

    pub fn as_ptr(&self) -> *const RawTypedParam {
        self.records.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut RawTypedParam {
        self.records.as_mut_ptr()
    }

    /// Overwrite the record at `index`.
    pub fn set(&mut self, index: usize, name: &str, value: &ParamValue) -> Result<()> {
        if let Strings::Foreign(_) = self.strings {
            return Err(Error::invalid(name, "buffer strings belong to the subsystem"));
        }
        let len = self.records.len();
        if index >= len {
            return Err(Error::invalid(name, format!("index {index} outside buffer of {len}")));
        }
        let record = RawTypedParam::owned(name, value)?;
        let slot = &mut self.records[index];
        unsafe { release_owned(slot) };
        *slot = record;
        Ok(())
    }

    /// Mark string payloads as allocated by the subsystem.
    ///
    /// # Safety
    ///
    /// Every non-null string payload must have been allocated by the
    /// subsystem and be releasable by `release`; none may come from
    /// [`RawParams::set`].
    pub unsafe fn adopt_foreign(&mut self, release: ReleaseFn) {
        self.strings = Strings::Foreign(release);
    }

    /// Keep the first `len` records, releasing the rest.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.records.len() {
            return;
        }
        self.release(len..);
        self.records.truncate(len);
    }

    fn release(&mut self, range: RangeFrom<usize>) {
        let tail = &mut self.records[range];
        if tail.is_empty() {
            return;
        }
        match self.strings {
            Strings::Owned => tail.iter_mut().for_each(|r| unsafe { release_owned(r) }),
            Strings::Foreign(release) => unsafe { release(tail.as_mut_ptr(), tail.len()) },
        }
    }

    pub fn decode(&self) -> Result<ParameterSet> {
        decode(&self.records)
    }
}

impl Drop for RawParams {
    fn drop(&mut self) {
        self.release(0..);
    }
}

/// Decode raw records into a parameter set. Nothing is returned unless every
/// record decodes.
pub fn decode(records: &[RawTypedParam]) -> Result<ParameterSet> {
    let mut set = ParameterSet::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        let TypedValue { name, value } = record.read(index)?;
        if set.contains(&name) {
            debug!("duplicate parameter {name:?} at index {index}, keeping the later value");
        }
        set.insert(name, value);
    }
    Ok(set)
}

/// Encode a parameter set. On error every string allocated so far is freed.
pub fn encode(set: &ParameterSet) -> Result<RawParams> {
    let mut raw = RawParams {
        records: Vec::with_capacity(set.len()),
        strings: Strings::Owned,
    };
    for entry in set {
        raw.records.push(RawTypedParam::owned(&entry.name, &entry.value)?);
    }
    Ok(raw)
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn sample() -> ParameterSet {
        let mut set = ParameterSet::new();
        set.insert("cpu_shares", 1024u64);
        set.insert("vcpu_quota", -1i64);
        set.insert("weight", 500u32);
        set.insert("offset", -7i32);
        set.insert("ratio", 0.75f64);
        set.insert("enabled", true);
        set.insert("device_weight", "/dev/sda,100");
        set
    }

    #[test]
    fn test_round_trip() {
        let set = sample();
        let raw = encode(&set).unwrap();
        assert_eq!(raw.len(), set.len());
        assert_eq!(raw.decode().unwrap(), set);
    }

    #[test]
    fn test_round_trip_edge_values() {
        let mut set = ParameterSet::new();
        set.insert("i32_min", i32::MIN);
        set.insert("i32_max", i32::MAX);
        set.insert("u32_max", u32::MAX);
        set.insert("i64_min", i64::MIN);
        set.insert("u64_max", u64::MAX);
        set.insert("empty", "");
        set.insert("n".repeat(FIELD_LENGTH - 1), false);
        set.insert("h\u{f4}te", "caf\u{e9} \u{1f5a5}");
        set.insert("tiny", f64::MIN_POSITIVE);
        let raw = encode(&set).unwrap();
        assert_eq!(raw.decode().unwrap(), set);
    }

    mod props {
        use proptest::prelude::*;

        use crate::{codec::encode, ParamValue, ParameterSet, FIELD_LENGTH};

        fn name() -> impl Strategy<Value = String> {
            prop_oneof![
                "[a-z_][a-z0-9_.]{0,78}",
                Just("n".repeat(FIELD_LENGTH - 1)),
                "[^\\x00]{1,19}".prop_filter("fits the field", |n| n.len() < FIELD_LENGTH),
            ]
        }

        fn value() -> impl Strategy<Value = ParamValue> {
            prop_oneof![
                any::<i32>().prop_map(ParamValue::Int32),
                any::<u32>().prop_map(ParamValue::UInt32),
                any::<i64>().prop_map(ParamValue::Int64),
                any::<u64>().prop_map(ParamValue::UInt64),
                any::<f64>()
                    .prop_filter("NaN is never equal", |d| !d.is_nan())
                    .prop_map(ParamValue::Double),
                any::<bool>().prop_map(ParamValue::Boolean),
                "[^\\x00]{0,64}".prop_map(ParamValue::String),
                Just(ParamValue::Int32(i32::MIN)),
                Just(ParamValue::UInt64(u64::MAX)),
                Just(ParamValue::String(String::new())),
            ]
        }

        fn parameter_set() -> impl Strategy<Value = ParameterSet> {
            prop::collection::vec((name(), value()), 0..12).prop_map(|entries| {
                let mut set = ParameterSet::new();
                for (name, value) in entries {
                    set.insert(name, value);
                }
                set
            })
        }

        proptest! {
            #[test]
            fn decode_inverts_encode(set in parameter_set()) {
                let raw = encode(&set).unwrap();
                prop_assert_eq!(raw.len(), set.len());
                prop_assert_eq!(raw.decode().unwrap(), set);
            }
        }
    }

    #[test]
    fn test_layout_matches_c_record() {
        assert_eq!(std::mem::size_of::<RawTypedParam>(), 96);
        assert_eq!(std::mem::align_of::<RawTypedParam>(), 8);
    }

    #[test]
    fn test_name_too_long() {
        let mut set = ParameterSet::new();
        set.insert("ok", 1i32);
        set.insert("x".repeat(90), "leaks if not freed");

        match encode(&set) {
            Err(Error::NameTooLong { len, max, .. }) => {
                assert_eq!(len, 90);
                assert_eq!(max, FIELD_LENGTH - 1);
            }
            other => panic!("expected NameTooLong, got {:?}", other.map(|r| r.len())),
        }

        let mut set = ParameterSet::new();
        set.insert("y".repeat(FIELD_LENGTH - 1), 1i32);
        assert!(encode(&set).is_ok());
    }

    #[test]
    fn test_invalid_names_and_strings() {
        let mut set = ParameterSet::new();
        set.insert("", 1i32);
        assert!(matches!(encode(&set), Err(Error::InvalidValue { .. })));

        let mut set = ParameterSet::new();
        set.insert("path", "a\0b");
        assert!(matches!(encode(&set), Err(Error::InvalidValue { .. })));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut records = vec![RawTypedParam::default(), RawTypedParam::default()];
        records[0].set_name("good").unwrap();
        records[0].kind = ParamKind::UInt32.tag();
        records[0].value = RawValue { ui: 3 };
        records[1].set_name("future").unwrap();
        records[1].kind = 99;

        match decode(&records) {
            Err(Error::Decode { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected Decode error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_broken_records() {
        let mut unterminated = RawTypedParam::default();
        unterminated.field = [b'a' as c_char; FIELD_LENGTH];
        unterminated.kind = ParamKind::Int32.tag();
        assert!(matches!(decode(&[unterminated]), Err(Error::Decode { .. })));

        let mut null_string = RawTypedParam::default();
        null_string.set_name("label").unwrap();
        null_string.kind = ParamKind::String.tag();
        assert!(matches!(decode(&[null_string]), Err(Error::Decode { .. })));
    }

    #[test]
    fn test_boolean_bytes() {
        let mut set = ParameterSet::new();
        set.insert("on", true);
        set.insert("off", false);
        let raw = encode(&set).unwrap();
        unsafe {
            assert_eq!(raw.records()[0].value.b, 1);
            assert_eq!(raw.records()[1].value.b, 0);
        }

        let mut record = RawTypedParam::default();
        record.set_name("flag").unwrap();
        record.kind = ParamKind::Boolean.tag();
        record.value = RawValue { b: 7 };
        let set = decode(&[record]).unwrap();
        assert_eq!(set.get("flag"), Some(&ParamValue::Boolean(true)));
    }

    #[test]
    fn test_duplicate_names_keep_first_position() {
        let mut raw = RawParams::zeroed(3);
        raw.set(0, "a", &ParamValue::Int32(1)).unwrap();
        raw.set(1, "b", &ParamValue::Int32(2)).unwrap();
        raw.set(2, "a", &ParamValue::Int32(3)).unwrap();

        let set = raw.decode().unwrap();
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(set.get("a"), Some(&ParamValue::Int32(3)));
    }

    static RELEASED: AtomicUsize = AtomicUsize::new(0);

    unsafe fn count_release(_: *mut RawTypedParam, len: usize) {
        RELEASED.fetch_add(len, Ordering::SeqCst);
    }

    #[test]
    fn test_foreign_release_on_truncate_and_drop() {
        let mut raw = RawParams::zeroed(4);
        unsafe { raw.adopt_foreign(count_release) };
        assert!(raw.set(0, "a", &ParamValue::Int32(1)).is_err());

        raw.truncate(1);
        assert_eq!(RELEASED.load(Ordering::SeqCst), 3);
        drop(raw);
        assert_eq!(RELEASED.load(Ordering::SeqCst), 4);
    }
}
