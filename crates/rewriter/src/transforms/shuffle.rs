//! The random relinker.
//!
//! Shuffles the layout order of blocks inside every code section with a
//! seeded RNG. Diagnostic by nature: it bounds what reordering can buy and
//! flushes out references that only survive the original layout.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::info;

use crate::block_graph::BlockGraph;
use crate::pe::IMAGE_SCN_CNT_CODE;

use super::{Transform, TransformContext};

pub struct ShuffleTransform {
    seed: u64,
}

impl ShuffleTransform {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl Transform for ShuffleTransform {
    fn name(&self) -> &'static str {
        "random-relinker"
    }

    fn transform(&mut self, graph: &mut BlockGraph, _context: &TransformContext) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let sections: Vec<u32> = graph
            .sections()
            .filter(|s| s.characteristics & IMAGE_SCN_CNT_CODE != 0)
            .map(|s| s.id)
            .collect();
        for section in sections {
            let mut order = graph.blocks_in_section(section);
            if order.len() < 2 {
                continue;
            }
            order.shuffle(&mut rng);
            info!(
                "{}: shuffled {} block(s) in section {section} (seed {})",
                self.name(),
                order.len(),
                self.seed
            );
            graph.set_section_order(section, order);
        }
        Ok(())
    }
}
