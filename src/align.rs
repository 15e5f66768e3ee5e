/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

#[macro_export]
macro_rules! ROUNDUP {
    ($a: expr, $b: expr) => {((($a) + (($b)-1)) & !(($b)-1))}
}

#[macro_export]
macro_rules! IS_ALIGNED {
    ($a: expr, $b: expr) => {((($a) & (($b) - 1)) == 0)}
}

/* Round up to any multiple, not just powers of two. */
#[macro_export]
macro_rules! SIZE_TO_MULTIPLE {
    ($a: expr, $b: expr) => {
        if ($a) % ($b) > 0 { ($a) + (($b) - ($a) % ($b)) } else { ($a) }
    }
}
