/*
Copyright 2025  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use libc::{SIGPIPE, SIG_ERR, SIG_IGN};

use crate::Result;

/// Install the process-wide signal dispositions the loader relies on.
///
/// `SIGPIPE` is ignored so that a payload, or the server itself, writing to
/// a peer that has gone away gets `EPIPE` instead of killing the loader.
///
/// Note: this replaces any existing `SIGPIPE` disposition of the embedding
/// process. No chaining to a previous handler is done.
pub fn setup_signal_handlers() -> Result<()> {
    // SAFETY: SIG_IGN installs no handler code, so nothing here has to be
    // async-signal-safe
    if unsafe { libc::signal(SIGPIPE, SIG_IGN) } == SIG_ERR {
        return Err(std::io::Error::last_os_error().into());
    }
    log::trace!("SIGPIPE ignored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::setup_signal_handlers;

    #[test]
    fn sigpipe_is_ignored() {
        setup_signal_handlers().unwrap();
        let current = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
        assert_eq!(current, libc::SIG_IGN);
    }
}
