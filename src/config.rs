/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use std::env;
use std::ffi::CString;
use crate::defines::*;

/* Runtime configuration. Environment overrides are read once during init,
 * after the real allocator is usable; malformed values keep the default. */
#[derive(Clone)]
pub struct Config {
    pub min_size_fry: usize,
    pub min_size_bigmaac: usize,
    pub size_fries: usize,
    pub size_bigmaac: usize,
    pub fry_size_multiple: usize,
    pub template: CString,
    pub page_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_size_fry: DEFAULT_MIN_FRY_SIZE,
            min_size_bigmaac: DEFAULT_MIN_BIGMAAC_SIZE,
            size_fries: DEFAULT_SIZE_FRIES,
            size_bigmaac: DEFAULT_SIZE_BIGMAAC,
            fry_size_multiple: DEFAULT_FRY_SIZE_MULTIPLE,
            template: CString::new(DEFAULT_TEMPLATE).unwrap(),
            page_size: system_page_size(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_usize("BIGMAAC_MIN_BIGMAAC_SIZE") {
            cfg.min_size_bigmaac = v;
        }
        if let Some(v) = env_usize("BIGMAAC_MIN_FRY_SIZE") {
            cfg.min_size_fry = v;
        }
        if let Some(v) = env_usize("SIZE_FRIES") {
            cfg.size_fries = v;
        }
        if let Some(v) = env_usize("SIZE_BIGMAAC") {
            cfg.size_bigmaac = v;
        }
        if let Ok(t) = env::var("BIGMAAC_TEMPLATE") {
            if let Ok(c) = CString::new(t) {
                cfg.template = c;
            }
        }
        cfg.normalize();
        cfg
    }

    /* A fry threshold of zero disables the fry class entirely. */
    pub fn normalize(&mut self) {
        if self.min_size_fry == 0 {
            self.min_size_fry = self.min_size_bigmaac;
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok()?.trim().parse().ok()
}
