use super::value::Value;
use core::mem::size_of;

/// Array body layout: a length word, padding up to the first element, then
/// `size` value slots. The slots are the scanned window.
#[repr(C)]
pub struct GcArray {
    pub size: u32,
    pub elems: [Value; 0],
}

impl GcArray {
    /// Element offset in value-sized units; doubles as the scan offset.
    pub const ELEMS_OFFSET: usize = size_of::<GcArray>() / size_of::<Value>();

    pub unsafe fn elems(array: *mut GcArray) -> *mut Value {
        (*array).elems.as_mut_ptr()
    }
}

/// String body layout: a length word and `size + 1` bytes, NUL-terminated.
/// Strings are data objects; the collector never scans their bytes.
#[repr(C)]
pub struct GcString {
    pub size: u32,
    pub data: [u8; 0],
}

impl GcString {
    pub unsafe fn data(string: *mut GcString) -> *mut u8 {
        (*string).data.as_mut_ptr()
    }

    pub unsafe fn bytes<'a>(string: *const GcString) -> &'a [u8] {
        core::slice::from_raw_parts((*string).data.as_ptr(), (*string).size as usize)
    }
}
