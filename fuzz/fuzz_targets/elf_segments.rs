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
use elfldr_testing::elf::ElfBuilder;
use libfuzzer_sys::fuzz_target;

// Well-formed headers with arbitrary segment layouts, which reach the
// layout checks far more often than raw bytes do.
fuzz_target!(|input: (u64, Vec<(u64, Vec<u8>, u64, u32)>)| {
    let (entry, segments) = input;
    let mut builder = ElfBuilder::new().entry(entry);
    for (vaddr, data, memsz, flags) in segments.iter().take(8) {
        builder = builder.segment(*vaddr % (1 << 16), data, *memsz % (1 << 16), *flags);
    }
    let bytes = builder.build();
    if let Ok(image) = ElfImage::new(bytes.clone()) {
        let size = image.required_memory_size();
        let mut target = vec![0x5au8; size];
        image.load(&mut target).unwrap();
        let mut fresh = vec![0u8; size];
        image.load_zeroed(&mut fresh).unwrap();
        assert_eq!(target, fresh);

        // later segments overwrite earlier ones, so the last is intact
        if let Some(seg) = image.segments().last() {
            let dst = usize::try_from(seg.destination).unwrap();
            let src = &bytes[seg.source_offset..seg.source_offset + seg.source_len];
            assert_eq!(&target[dst..dst + seg.source_len], src);
            let tail = &target[dst + seg.source_len..dst + seg.destination_len];
            assert!(tail.iter().all(|&b| b == 0));
        }
    }
});
