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

/// A minimal ELF loader that works purely on offsets into a caller-supplied
/// destination
pub mod elf;
/// A wrapper around unsafe functionality to create and release memory
/// regions with separate writable and executable views.
pub mod protected_mem;
/// Structures to represent an offset into a loaded image
pub mod ptr_offset;
