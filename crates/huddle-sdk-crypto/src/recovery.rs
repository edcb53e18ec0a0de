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

//! Mnemonic recovery passphrases.
//!
//! When a user enables E2EE without ever picking a password, the machine
//! mints a random passphrase for them, wraps the private key under it and
//! shows it once for safekeeping. Words are easier to write down than a
//! base64 blob, which is the whole point: this passphrase is the only way
//! back into the account's encrypted history on a new device.

use rand::{Rng, thread_rng};

/// The words a recovery passphrase is assembled from.
///
/// 256 entries, so every word contributes 8 bits of entropy.
const WORDLIST: &[&str] = &[
    "acorn", "amber", "anchor", "apple", "april", "arrow", "aspen", "atlas",
    "autumn", "badge", "bamboo", "banner", "basil", "beacon", "berry", "birch",
    "bishop", "blanket", "blossom", "border", "bottle", "breeze", "bridge", "bronze",
    "brook", "bucket", "butter", "cabin", "cactus", "camera", "candle", "canoe",
    "canyon", "carbon", "carpet", "castle", "cedar", "cellar", "chalk", "cherry",
    "compass", "copper", "coral", "cotton", "cradle", "crater", "cricket", "crystal",
    "curtain", "cypress", "daisy", "dawn", "delta", "denim", "desert", "diamond",
    "dolphin", "donkey", "drift", "eagle", "easel", "echo", "elbow", "ember",
    "engine", "envelope", "estate", "fabric", "falcon", "feather", "fennel", "ferry",
    "fiddle", "field", "finch", "fjord", "flannel", "flint", "forest", "fossil",
    "fountain", "frost", "galaxy", "garden", "garnet", "geyser", "ginger", "glacier",
    "goblet", "granite", "grape", "gravel", "grove", "guitar", "hammock", "harbor",
    "harvest", "hazel", "heron", "hickory", "hollow", "honey", "horizon", "hornet",
    "iceberg", "indigo", "island", "ivory", "jacket", "jasmine", "jasper", "jigsaw",
    "journal", "jungle", "juniper", "kettle", "kitten", "ladder", "lagoon", "lantern",
    "laurel", "lavender", "legend", "lemon", "lilac", "linen", "lizard", "lobster",
    "locket", "lotus", "lumber", "magnet", "mango", "mantle", "maple", "marble",
    "meadow", "melon", "mineral", "mirror", "mitten", "morning", "mosaic", "mountain",
    "muffin", "mulberry", "mustard", "napkin", "nectar", "needle", "nickel", "nimbus",
    "noodle", "nutmeg", "oasis", "ocean", "olive", "onion", "opal", "orchard",
    "orchid", "otter", "oyster", "paddle", "pagoda", "palace", "panda", "pantry",
    "parrot", "pasture", "peach", "pebble", "pelican", "pepper", "petal", "pewter",
    "pigeon", "pillow", "pine", "planet", "plum", "pocket", "pollen", "pond",
    "poplar", "poppy", "prairie", "puddle", "pumpkin", "quarry", "quartz", "quill",
    "quilt", "rabbit", "raccoon", "radish", "rainbow", "raisin", "raven", "reef",
    "ribbon", "ridge", "river", "robin", "rocket", "rosemary", "saddle", "saffron",
    "sailor", "salmon", "sandal", "sapphire", "satchel", "seagull", "seashell", "sequoia",
    "shadow", "shelter", "sierra", "silver", "sketch", "sleigh", "socket", "sorrel",
    "sparrow", "spindle", "spruce", "squirrel", "stable", "stone", "stream", "summit",
    "sunset", "sycamore", "tadpole", "teapot", "temple", "thicket", "thimble", "thunder",
    "timber", "toffee", "trellis", "trumpet", "tulip", "tundra", "turnip", "turtle",
    "umbrella", "velvet", "village", "walnut", "willow", "winter", "wreath", "zephyr",
];

/// Generate a random recovery passphrase of the given word count.
///
/// Words are drawn uniformly and independently, so repeats are possible
/// and the phrase carries exactly `word_count * 8` bits of entropy.
pub fn generate_passphrase(word_count: usize) -> String {
    let mut rng = thread_rng();

    let words: Vec<&str> =
        (0..word_count).map(|_| WORDLIST[rng.gen_range(0..WORDLIST.len())]).collect();

    words.join(" ")
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{WORDLIST, generate_passphrase};

    #[test]
    fn wordlist_is_well_formed() {
        assert_eq!(WORDLIST.len(), 256);

        let unique: HashSet<_> = WORDLIST.iter().collect();
        assert_eq!(unique.len(), WORDLIST.len(), "the wordlist must not contain duplicates");

        for word in WORDLIST {
            assert!(word.chars().all(|c| c.is_ascii_lowercase()), "{word} is not lowercase ascii");
        }
    }

    #[test]
    fn passphrases_have_the_requested_word_count() {
        let passphrase = generate_passphrase(5);
        let words: Vec<_> = passphrase.split(' ').collect();

        assert_eq!(words.len(), 5);

        for word in words {
            assert!(WORDLIST.contains(&word), "{word} is not a wordlist word");
        }
    }

    #[test]
    fn passphrases_are_random() {
        // Two equal 8-word phrases would be a 2^-64 coincidence.
        assert_ne!(generate_passphrase(8), generate_passphrase(8));
    }
}
