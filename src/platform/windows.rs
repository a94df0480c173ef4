//! Windows virtual memory via `VirtualAlloc`/`VirtualFree`, and page size via
//! `GetSystemInfo`.

use core::mem::MaybeUninit;
use core::ptr;
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
use winapi::um::sysinfoapi::GetSystemInfo;
use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};

pub(super) fn query_page_size() -> usize {
    unsafe {
        let mut info = MaybeUninit::zeroed();
        GetSystemInfo(info.as_mut_ptr());
        info.assume_init().dwPageSize as usize
    }
}

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    let ptr = unsafe {
        VirtualAlloc(
            ptr::null_mut(),
            size,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        )
    };
    ptr as *mut u8
}

pub unsafe fn page_dealloc(ptr: *mut u8) {
    // MEM_RELEASE requires dwSize = 0 (releases the entire allocation).
    unsafe { VirtualFree(ptr as *mut winapi::ctypes::c_void, 0, MEM_RELEASE) };
}
