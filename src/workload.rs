use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::prelude::*;

/// Produces target URLs of the form `{base}/{path}/{id}` with ids drawn from `1..=id_max`.
///
/// The generator does not remember what it handed out. Callers that need the same sequence
/// twice (cold and warm runs) keep the returned `Vec` and replay it.
#[derive(Debug)]
pub struct Workload {
    base_url: String,
    path: String,
    id_max: u32,
    rng: StdRng,
}

impl Workload {
    pub fn new(base_url: &str, path: &str, id_max: u32, seed: u64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            path: path.trim_matches('/').to_string(),
            id_max: id_max.max(1),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn url_for(&self, id: u32) -> String {
        format!("{}/{}/{}", self.base_url, self.path, id)
    }

    /// `count` URLs with independently drawn ids (repeats allowed).
    pub fn generate(&mut self, count: usize) -> Vec<String> {
        (0..count)
            .map(|_| {
                let id = self.rng.gen_range(1..=self.id_max);
                self.url_for(id)
            })
            .collect()
    }

    /// `count` pairwise distinct ids, sampled without replacement.
    pub fn unique_ids(&mut self, count: usize) -> Result<Vec<u32>> {
        let range = self.id_max as usize;
        if count > range {
            return Err(Error::Config(format!(
                "cannot draw {} unique ids from 1..={}",
                count, self.id_max
            )));
        }
        Ok(rand::seq::index::sample(&mut self.rng, range, count)
            .into_iter()
            .map(|i| i as u32 + 1)
            .collect())
    }
}

/// Seed derived from the wall clock, for runs that do not ask for reproducibility.
pub fn clock_seed() -> u64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64
}
