//! Native AppleEvent transport over the CoreServices Apple Event Manager.
//!
//! Only built on macOS with the `apple_events` feature. Every native
//! descriptor lives in a [`NativeDesc`] whose `Drop` calls `AEDisposeDesc`,
//! so early returns cannot leak them.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::mem::size_of;
use std::os::raw::c_long;
use std::ptr;
use std::time::Duration;

use tracing::{debug, warn};

use super::apple_event::{codes, AeValue, AppleEvent, AppleEventTransport, FourCharCode, OsErr};

type DescType = u32;
type OSErrRaw = i16;
type OSStatus = i32;
type Size = isize;

/// `AEDesc` from AEDataModel.h (declared under `#pragma pack(2)`).
#[repr(C, packed(2))]
struct AEDesc {
    descriptor_type: DescType,
    data_handle: *mut c_void,
}

const TYPE_NULL: DescType = u32::from_be_bytes(*b"null");
const AUTO_GENERATE_RETURN_ID: i16 = -1;
const ANY_TRANSACTION_ID: i32 = 0;
const AE_WAIT_REPLY: i32 = 0x0000_0003;
const TICKS_PER_SECOND: u128 = 60;

#[link(name = "CoreServices", kind = "framework")]
extern "C" {
    fn AECreateDesc(
        type_code: DescType,
        data_ptr: *const c_void,
        data_size: Size,
        result: *mut AEDesc,
    ) -> OSErrRaw;

    fn AECreateAppleEvent(
        event_class: u32,
        event_id: u32,
        target: *const AEDesc,
        return_id: i16,
        transaction_id: i32,
        result: *mut AEDesc,
    ) -> OSErrRaw;

    fn AEPutParamPtr(
        event: *mut AEDesc,
        keyword: u32,
        type_code: DescType,
        data_ptr: *const c_void,
        data_size: Size,
    ) -> OSErrRaw;

    fn AESendMessage(
        event: *const AEDesc,
        reply: *mut AEDesc,
        send_mode: i32,
        timeout_ticks: c_long,
    ) -> OSStatus;

    fn AEGetParamPtr(
        event: *const AEDesc,
        keyword: u32,
        desired_type: DescType,
        actual_type: *mut DescType,
        data_ptr: *mut c_void,
        maximum_size: Size,
        actual_size: *mut Size,
    ) -> OSErrRaw;

    fn AEDisposeDesc(desc: *mut AEDesc) -> OSErrRaw;
}

/// Owned native descriptor.
struct NativeDesc(AEDesc);

impl NativeDesc {
    fn null() -> Self {
        Self(AEDesc {
            descriptor_type: TYPE_NULL,
            data_handle: ptr::null_mut(),
        })
    }

    fn as_ptr(&self) -> *const AEDesc {
        &self.0
    }

    fn as_mut_ptr(&mut self) -> *mut AEDesc {
        &mut self.0
    }
}

impl Drop for NativeDesc {
    fn drop(&mut self) {
        // SAFETY: the descriptor is either the null descriptor or one created
        // by the Apple Event Manager and not yet disposed.
        let err = unsafe { AEDisposeDesc(self.as_mut_ptr()) };
        if err != 0 {
            warn!(error = err, "AEDisposeDesc failed");
        }
    }
}

fn check(err: OSErrRaw) -> Result<(), OsErr> {
    if err == 0 {
        Ok(())
    } else {
        Err(OsErr(i32::from(err)))
    }
}

fn timeout_ticks(timeout: Duration) -> c_long {
    let ticks = timeout.as_millis() * TICKS_PER_SECOND / 1000;
    c_long::try_from(ticks).unwrap_or(c_long::MAX).max(1)
}

/// Transport that delivers events through `AESendMessage`.
#[derive(Debug, Default)]
pub struct CoreServicesTransport;

impl CoreServicesTransport {
    /// Create the transport.
    pub fn new() -> Self {
        Self
    }

    fn put_param(native: &mut NativeDesc, key: FourCharCode, value: AeValue) -> Result<(), OsErr> {
        let err = match value {
            AeValue::SInt16(v) => unsafe {
                // SAFETY: pointer and size describe `v`, which outlives the call.
                AEPutParamPtr(
                    native.as_mut_ptr(),
                    key.as_u32(),
                    codes::TYPE_SINT16.as_u32(),
                    (&v as *const i16).cast(),
                    size_of::<i16>() as Size,
                )
            },
            AeValue::SInt32(v) => unsafe {
                // SAFETY: as above.
                AEPutParamPtr(
                    native.as_mut_ptr(),
                    key.as_u32(),
                    codes::TYPE_SINT32.as_u32(),
                    (&v as *const i32).cast(),
                    size_of::<i32>() as Size,
                )
            },
            AeValue::Float64(v) => unsafe {
                // SAFETY: as above.
                AEPutParamPtr(
                    native.as_mut_ptr(),
                    key.as_u32(),
                    codes::TYPE_IEEE64.as_u32(),
                    (&v as *const f64).cast(),
                    size_of::<f64>() as Size,
                )
            },
        };
        check(err)
    }

    fn get_i16(native: &NativeDesc, key: FourCharCode) -> Option<i16> {
        let mut value: i16 = 0;
        let mut actual_type: DescType = 0;
        let mut actual_size: Size = 0;
        // SAFETY: `value` is a valid destination of `maximum_size` bytes.
        let err = unsafe {
            AEGetParamPtr(
                native.as_ptr(),
                key.as_u32(),
                codes::TYPE_SINT16.as_u32(),
                &mut actual_type,
                (&mut value as *mut i16).cast(),
                size_of::<i16>() as Size,
                &mut actual_size,
            )
        };
        (err == 0).then_some(value)
    }

    fn get_i32(native: &NativeDesc, key: FourCharCode) -> Option<i32> {
        let mut value: i32 = 0;
        let mut actual_type: DescType = 0;
        let mut actual_size: Size = 0;
        // SAFETY: `value` is a valid destination of `maximum_size` bytes.
        let err = unsafe {
            AEGetParamPtr(
                native.as_ptr(),
                key.as_u32(),
                codes::TYPE_SINT32.as_u32(),
                &mut actual_type,
                (&mut value as *mut i32).cast(),
                size_of::<i32>() as Size,
                &mut actual_size,
            )
        };
        (err == 0).then_some(value)
    }
}

impl AppleEventTransport for CoreServicesTransport {
    fn send(
        &mut self,
        event: &AppleEvent,
        reply: &mut AppleEvent,
        timeout: Duration,
    ) -> Result<(), OsErr> {
        let signature = event.target().ok_or(OsErr::PROC_NOT_FOUND)?.as_u32();

        let mut target = NativeDesc::null();
        // SAFETY: `signature` is a valid OSType for the duration of the call.
        check(unsafe {
            AECreateDesc(
                codes::TYPE_APPL_SIGNATURE.as_u32(),
                (&signature as *const u32).cast(),
                size_of::<u32>() as Size,
                target.as_mut_ptr(),
            )
        })?;

        let mut native_event = NativeDesc::null();
        // SAFETY: `target` is a live address descriptor.
        check(unsafe {
            AECreateAppleEvent(
                event.event_class().as_u32(),
                event.event_id().as_u32(),
                target.as_ptr(),
                AUTO_GENERATE_RETURN_ID,
                ANY_TRANSACTION_ID,
                native_event.as_mut_ptr(),
            )
        })?;

        for (key, value) in event.params() {
            Self::put_param(&mut native_event, *key, *value)?;
        }

        let mut native_reply = NativeDesc::null();
        debug!(
            class = %event.event_class(),
            id = %event.event_id(),
            "AESendMessage"
        );
        // SAFETY: both descriptors are live; the reply is written by the call.
        let status = unsafe {
            AESendMessage(
                native_event.as_ptr(),
                native_reply.as_mut_ptr(),
                AE_WAIT_REPLY,
                timeout_ticks(timeout),
            )
        };
        if status != 0 {
            return Err(OsErr(status));
        }

        if let Some(status) = Self::get_i16(&native_reply, codes::KEY_DIRECT_OBJECT) {
            reply.put_param(codes::KEY_DIRECT_OBJECT, AeValue::SInt16(status));
        }
        if let Some(errn) = Self::get_i32(&native_reply, codes::KEY_ERROR_NUMBER) {
            reply.put_param(codes::KEY_ERROR_NUMBER, AeValue::SInt32(errn));
        }
        Ok(())
    }
}
