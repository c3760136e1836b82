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

#![no_main]

use elfldr_host::ElfImage;
use libfuzzer_sys::{fuzz_target, Corpus};

// Loading is bounded so a hostile footprint cannot exhaust memory here.
const MAX_FOOTPRINT: usize = 1 << 20;

fuzz_target!(|data: &[u8]| -> Corpus {
    let loadable = ElfImage::is_loadable(data);
    let image = match ElfImage::new(data.to_vec()) {
        Ok(image) => image,
        Err(_) => {
            assert!(!loadable);
            return Corpus::Reject;
        }
    };
    assert!(loadable);

    let size = image.required_memory_size();
    if size <= MAX_FOOTPRINT {
        let mut target = vec![0xa5u8; size];
        image.load(&mut target).unwrap();
        let mut fresh = vec![0u8; size];
        image.load_zeroed(&mut fresh).unwrap();
        assert_eq!(target, fresh);
        for seg in image.segments() {
            let dst = usize::try_from(seg.destination).unwrap();
            assert!(dst + seg.destination_len <= size);
        }
    }
    image.release();
    Corpus::Keep
});
