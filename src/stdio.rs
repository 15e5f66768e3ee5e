/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use core::fmt;
use spin::Mutex;
use std::ffi::CStr;

/* Diagnostics sink over raw write(2) to fd 2. Every shim may need to report
 * from inside an allocation path, so this must never allocate. */
pub struct StdErr;

impl StdErr {
    pub fn puts(&mut self, s: &str) {
        let mut bytes = s.as_bytes();
        while !bytes.is_empty() {
            let ret = unsafe {
                libc::write(libc::STDERR_FILENO,
                            bytes.as_ptr() as *const libc::c_void,
                            bytes.len())
            };
            if ret < 0 {
                if errno() == libc::EINTR {
                    continue;
                }
                return;
            }
            bytes = &bytes[ret as usize..];
        }
    }
}

impl fmt::Write for StdErr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.puts(s);
        Ok(())
    }
}

pub static STDERR: Mutex<StdErr> = Mutex::new(StdErr);

pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = STDERR.lock().write_fmt(args);
}

pub fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

pub fn set_errno(err: i32) {
    unsafe { *libc::__errno_location() = err; }
}

/* strerror is not re-entrant; diagnostics here are best effort. */
pub fn strerror(err: i32) -> &'static str {
    unsafe {
        let msg = libc::strerror(err);
        if msg.is_null() {
            return "unknown error";
        }
        match CStr::from_ptr(msg).to_str() {
            Ok(s) => s,
            Err(_) => "unknown error",
        }
    }
}
