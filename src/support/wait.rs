//-
// Copyright (c) 2026, The Mailgate developers
//
// This file is part of Mailgate.
//
// Mailgate is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailgate is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailgate. If not, see <http://www.gnu.org/licenses/>.

use std::time::Duration;

/// Polls a condition at a fixed interval until it holds or a time budget is
/// exhausted.
///
/// Time is only ever advanced through the sleeper passed to `until_with`, so
/// tests can substitute a fake clock.
#[derive(Clone, Copy, Debug)]
pub struct BoundedWait {
    pub timeout: Duration,
    pub interval: Duration,
}

impl BoundedWait {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        BoundedWait { timeout, interval }
    }

    /// Wait on the real clock. Returns whether `cond` became true.
    pub fn until(&self, cond: impl FnMut() -> bool) -> bool {
        self.until_with(cond, std::thread::sleep)
    }

    pub fn until_with(
        &self,
        mut cond: impl FnMut() -> bool,
        mut sleep: impl FnMut(Duration),
    ) -> bool {
        let mut waited = Duration::from_secs(0);
        loop {
            if cond() {
                return true;
            }

            if waited >= self.timeout || self.interval == Duration::from_secs(0)
            {
                return false;
            }

            let step = self.interval.min(self.timeout - waited);
            sleep(step);
            waited += step;
        }
    }
}
