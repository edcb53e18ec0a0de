// Copyright 2024 The Huddle Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use base64::{DecodeError, Engine, engine::general_purpose::STANDARD};

/// Encode bytes as standard, padded base64.
pub(crate) fn base64_encode(input: impl AsRef<[u8]>) -> String {
    STANDARD.encode(input)
}

/// Decode standard, padded base64.
pub(crate) fn base64_decode(input: impl AsRef<[u8]>) -> Result<Vec<u8>, DecodeError> {
    STANDARD.decode(input)
}
