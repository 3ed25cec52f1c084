// Bike Tracker - RTC Retained Memory
//
// The cross-sleep state lives in RTC slow memory, which keeps its contents
// through deep sleep and is garbage after power-on.  The magic/checksum in
// the encoded words tells the two apart.

use std::sync::atomic::{AtomicU32, Ordering};

use tracker_core::retained::{CrossSleepState, WORDS};

#[link_section = ".rtc.data"]
static RTC_WORDS: [AtomicU32; WORDS] = [
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
];

/// Decode whatever the previous wake left behind.
pub fn load() -> Option<CrossSleepState> {
    let words: [u32; WORDS] = core::array::from_fn(|i| RTC_WORDS[i].load(Ordering::Relaxed));
    CrossSleepState::from_words(&words)
}

pub fn save(state: &CrossSleepState) {
    for (slot, word) in RTC_WORDS.iter().zip(state.to_words()) {
        slot.store(word, Ordering::Relaxed);
    }
}
