use std::{ffi::CString, os::raw::c_char, ptr};

use crate::cstr::{copy_cstr, field_name, take_cstr};

#[test]
fn test_copy_cstr() {
    let name = CString::new("vm0").unwrap();
    assert_eq!(unsafe { copy_cstr(name.as_ptr()) }, Some("vm0".to_string()));
    assert_eq!(unsafe { copy_cstr(ptr::null()) }, None);
}

#[test]
fn test_take_cstr_frees_malloced_string() {
    let src = CString::new("default").unwrap();
    let owned = unsafe { libc::strdup(src.as_ptr()) };
    assert!(!owned.is_null());
    assert_eq!(unsafe { take_cstr(owned) }, Some("default".to_string()));
    assert_eq!(unsafe { take_cstr(ptr::null_mut()) }, None);
}

#[test]
fn test_field_name() {
    let mut field = [0 as c_char; 80];
    for (slot, b) in field.iter_mut().zip(b"kernel") {
        *slot = *b as c_char;
    }
    assert_eq!(field_name(&field), "kernel");
    assert_eq!(field_name(&[0 as c_char; 80]), "");

    let full = [b'a' as c_char; 80];
    assert_eq!(field_name(&full).len(), 80);
}

#[cfg(not(feature = "libvirt"))]
#[test]
fn test_connect_without_libvirt() {
    let err = crate::connect("qemu:///system").err().unwrap();
    assert!(err.to_string().contains("libvirt"));
}
