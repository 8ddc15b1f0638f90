use super::{drain, seeded_rng};
use crate::keys;
use crate::plugin::{Plugin, PluginCore};
use crate::stats::{StatHandle, StatType};
use anyhow::Context;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

pub const NAME: &str = "byte_flip";

/// Adds a small random value (1..=15, wrapping) to one random byte of `input`.
///
/// An empty input becomes a single zero byte first.
pub fn flip_single_byte<R: Rng + ?Sized>(input: &mut Vec<u8>, rng: &mut R) {
    if input.is_empty() {
        input.push(0);
    }
    let delta = rng.random_range(1u8..=15u8);
    let index = rng.random_range(0..input.len());
    input[index] = input[index].wrapping_add(delta);
}

/// Pops `input_bytes`, mutates one byte and pushes the result as the only
/// element of `cur_input_chunks`.
///
/// When the front `exec_only` flag is set the input is forwarded unchanged.
#[derive(Default)]
pub struct ByteFlip {
    rng: Option<ChaCha8Rng>,
    mutations: Option<StatHandle>,
}

impl Plugin for ByteFlip {
    fn name(&self) -> &str {
        NAME
    }

    fn init(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        self.rng = Some(seeded_rng(core)?);
        self.mutations = Some(core.add_stat("total_mutations", StatType::Number, 8)?);
        Ok(())
    }

    fn do_work(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        let rng = self.rng.as_mut().context("byte_flip used before init")?;
        let mut input = core
            .pop_front(keys::INPUT_BYTES)
            .context("Nothing under 'input_bytes' to mutate")?
            .into_vec()
            .context("'input_bytes' does not hold a byte buffer")?;

        let exec_only = core
            .get(keys::EXEC_ONLY, 0)
            .and_then(|v| v.as_flag())
            .unwrap_or(false);
        if !exec_only {
            flip_single_byte(&mut input, rng);
            if let Some(mutations) = self.mutations {
                let stats = core.stats();
                let total = stats.number(mutations)?;
                stats.set_number(mutations, total + 1)?;
            }
        }

        drain(core, keys::CUR_INPUT_CHUNKS);
        core.push_back(keys::CUR_INPUT_CHUNKS, input)?;
        Ok(())
    }

    fn destroy(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        drain(core, keys::CUR_INPUT_CHUNKS);
        Ok(())
    }
}
