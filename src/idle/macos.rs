//! Idle probe for macOS using IOKit HIDIdleTime.

use core_foundation::base::TCFType;
use core_foundation::number::CFNumber;
use core_foundation::string::CFString;
use std::time::Duration;

use super::IdleProbe;

/// Reads `HIDIdleTime` from the `IOHIDSystem` service.
pub struct IoKitProbe;

impl IdleProbe for IoKitProbe {
    fn idle_time(&mut self) -> Option<Duration> {
        hid_idle_time()
    }
}

fn hid_idle_time() -> Option<Duration> {
    #[link(name = "IOKit", kind = "framework")]
    extern "C" {
        fn IOServiceGetMatchingService(
            main_port: u32,
            matching: core_foundation::base::CFTypeRef,
        ) -> u32;
        fn IOServiceMatching(name: *const std::os::raw::c_char) -> core_foundation::base::CFTypeRef;
        fn IORegistryEntryCreateCFProperty(
            entry: u32,
            key: core_foundation::string::CFStringRef,
            allocator: core_foundation::base::CFAllocatorRef,
            options: u32,
        ) -> core_foundation::base::CFTypeRef;
        fn IOObjectRelease(object: u32) -> i32;
    }

    // SAFETY: IOServiceMatching's dictionary is consumed by
    // IOServiceGetMatchingService; the service handle is released before
    // returning and the property follows the create rule.
    unsafe {
        let service_name = std::ffi::CString::new("IOHIDSystem").ok()?;
        let matching = IOServiceMatching(service_name.as_ptr());
        if matching.is_null() {
            return None;
        }

        let service = IOServiceGetMatchingService(0, matching);
        if service == 0 {
            return None;
        }

        let key = CFString::new("HIDIdleTime");
        let property = IORegistryEntryCreateCFProperty(
            service,
            key.as_concrete_TypeRef(),
            std::ptr::null(),
            0,
        );

        IOObjectRelease(service);

        if property.is_null() {
            return None;
        }

        // Nanoseconds since the last HID event
        let cf_number: CFNumber = CFNumber::wrap_under_create_rule(property as *mut _);
        let nanoseconds = cf_number.to_i64()?;

        Some(Duration::from_nanos(u64::try_from(nanoseconds).ok()?))
    }
}
