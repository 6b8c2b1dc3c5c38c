use bitvec::prelude::*;

use super::channel::ChannelValue;

/// Aggregate status word published on a `Status-Mon` channel.
///
/// Each bit flags one failed condition (a set bit means "not ok"); the labels
/// are published once on a `StatusLabels-Cte` channel so that clients can
/// render the word.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusWord {
    labels: Vec<&'static str>,
    bits: BitArray<[u32; 1], Lsb0>,
}

impl StatusWord {
    /// All bits start set: nothing is known to be ok until it has been checked
    pub fn new(labels: &[&'static str]) -> Self {
        let mut bits = BitArray::ZERO;
        for idx in 0..labels.len().min(32) {
            bits.set(idx, true);
        }
        Self {
            labels: labels.iter().take(32).copied().collect(),
            bits,
        }
    }

    pub fn set(&mut self, bit: usize, failed: bool) {
        if bit < self.labels.len() {
            self.bits.set(bit, failed);
        }
    }

    pub fn is_set(&self, bit: usize) -> bool {
        bit < self.labels.len() && self.bits[bit]
    }

    pub fn all_ok(&self) -> bool {
        self.bits.not_any()
    }

    /// The word as published on the status channel
    pub fn value(&self) -> i32 {
        self.bits.load::<u32>() as i32
    }

    pub fn labels(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.to_string()).collect()
    }

    /// Labels of the bits that are currently set
    pub fn failures(&self) -> Vec<&'static str> {
        self.bits
            .iter_ones()
            .filter_map(|idx| self.labels.get(idx).copied())
            .collect()
    }

    pub fn channel_value(&self) -> ChannelValue {
        ChannelValue::Int(self.value())
    }
}
