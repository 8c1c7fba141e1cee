//! Scans and patches real machine code in the running process

#![cfg(target_arch = "x86_64")]

use std::hint::black_box;
use std::mem;

use libhackable::tag::{END_TAG, START_TAG, STOP_SEARCH_TAG};
use libhackable::{hackable_begin, hackable_end, hackable_stop, Error, Hackables};
use region::Protection;

#[inline(never)]
/// A function carrying one hackable region
fn tagged(value: u32) -> u32 {
    let mut value = black_box(value);
    hackable_begin!();
    value = black_box(value.wrapping_mul(3));
    hackable_end!();
    hackable_stop!();
    value
}

#[test]
/// Tags emitted by the macros are found in compiled Rust code
fn test_scan_compiled_function() {
    let hackables = Hackables::native();

    let mut regions = unsafe { hackables.create(tagged as *const u8) };

    assert_eq!(regions.len(), 1);
    let region = &mut regions[0];
    assert_eq!(region.current_bytes(), region.original_bytes());
    assert!(!region.is_patched());

    // tags are harmless when executed
    assert_eq!(tagged(5), 15);

    // the original listing assembles back to the original bytes
    let listing = region.original_assembly().to_owned();
    region.activate(&listing).unwrap();
    assert_eq!(region.current_bytes(), region.original_bytes());
    assert_eq!(tagged(5), 15);

    region.restore().unwrap();
    assert_eq!(region.current_bytes(), region.original_bytes());
}

/// Executable page holding `mov eax, 1` between tags, followed by `ret`
struct Function {
    /// Backing allocation
    page: region::Allocation,
}

impl Function {
    /// Builds the function and makes it read-only executable code
    fn new() -> Self {
        // mov eax, 1; nop; nop
        Self::with_region(&[0xb8, 0x01, 0x00, 0x00, 0x00, 0x90, 0x90])
    }

    /// Builds a function whose hackable region holds `region`
    fn with_region(region: &[u8]) -> Self {
        let code = [
            &START_TAG[..],
            region,
            &END_TAG,
            &[0xc3], // ret
            &STOP_SEARCH_TAG,
        ]
        .concat();

        let mut page = region::alloc(code.len(), Protection::READ_WRITE).unwrap();
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), page.as_mut_ptr::<u8>(), code.len());
            region::protect(page.as_ptr::<u8>(), code.len(), Protection::READ_EXECUTE).unwrap();
        }
        Self { page }
    }

    /// Address of the first byte
    fn address(&self) -> *const u8 {
        self.page.as_ptr::<u8>()
    }

    /// Runs the function
    fn call(&self) -> u32 {
        let function: extern "C" fn() -> u32 = unsafe { mem::transmute(self.address()) };
        function()
    }
}

#[test]
/// Full lifecycle against write-protected code
fn test_patch_live_code() {
    let function = Function::new();
    let hackables = Hackables::native();
    assert_eq!(function.call(), 1);

    let mut regions = unsafe { hackables.create(function.address()) };
    assert_eq!(regions.len(), 1);
    let region = &mut regions[0];
    assert_eq!(region.original_len(), 7);
    assert_eq!(region.original_assembly(), "mov eax, 1\nnop\nnop");

    region.activate("mov eax, 42").unwrap();
    assert_eq!(function.call(), 42);

    region.activate("xor eax, eax\ninc eax\ninc eax").unwrap();
    assert_eq!(function.call(), 2);

    // too large for the region, the previous patch stays
    let result = region.activate("mov rax, 0x1122334455667788");
    assert!(matches!(result, Err(Error::SizeOverflow { .. })));
    assert_eq!(region.assembly(), "mov rax, 0x1122334455667788");
    assert_eq!(function.call(), 2);

    region.restore().unwrap();
    assert_eq!(function.call(), 1);

    // the page is back to read-only
    let protection = region::query(function.address()).unwrap().protection();
    assert_eq!(protection, Protection::READ_EXECUTE);
}

#[test]
/// Back-to-back tags give an empty region that can still be restored and activated
fn test_empty_region() {
    let function = Function::with_region(&[]);
    let hackables = Hackables::native();

    let mut regions = unsafe { hackables.create(function.address()) };
    assert_eq!(regions.len(), 1);
    let region = &mut regions[0];
    assert_eq!(region.original_len(), 0);

    region.restore().unwrap();
    region.activate("").unwrap();
    assert!(region.is_patched());
    assert!(matches!(region.activate("nop"), Err(Error::SizeOverflow { .. })));
    region.restore().unwrap();

    let protection = region::query(function.address()).unwrap().protection();
    assert_eq!(protection, Protection::READ_EXECUTE);
}
