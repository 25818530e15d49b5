/// Online compaction.
///
/// One pass measures how many bytes of every value-bearing file the last
/// committed root still references, and when enough is wasted, copies the
/// live values of the most wasteful files into a fresh pure-values file.
/// The tree is then remapped in a single unlogged version change, a key
/// index is written so the remap survives a restart, and the emptied files
/// are retired once no transaction can still read through them.
///
/// Before the remap is published a failure or cancellation deletes the
/// target file and leaves everything else as it was.
use anyhow::{Context, Result};
use btree::BTreeRoot;
use files::{AppendWriter, HEADER_LEN};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{is_cancelled, CancellationToken, EngineError, EngineInner};

/// Per-file waste at or below this many bytes is not worth a pass.
pub(crate) const NOISE_FLOOR: u64 = 1024;
/// Read granularity for source files.
pub(crate) const COPY_BLOCK: usize = 128 * 1024;

/// Bytes a file holds versus bytes the root still references in it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FileStat {
    pub(crate) total: u64,
    pub(crate) used: u64,
}

impl FileStat {
    pub(crate) fn new(total: u64) -> Self {
        Self { total, used: 0 }
    }

    pub(crate) fn waste(&self) -> u64 {
        if self.total == 0 {
            return 0;
        }
        self.total.saturating_sub(self.used)
    }
}

/// Sum of the waste of all files that waste more than [`NOISE_FLOOR`].
pub(crate) fn total_waste(stats: &BTreeMap<u32, FileStat>) -> u64 {
    stats
        .values()
        .map(FileStat::waste)
        .filter(|&w| w > NOISE_FLOOR)
        .sum()
}

/// The file with the largest waste whose live bytes fit into `space`.
/// Ties go to the lowest file id.
pub(crate) fn most_wasteful(stats: &BTreeMap<u32, FileStat>, space: u64) -> Option<u32> {
    if space == 0 {
        return None;
    }
    let mut best: Option<(u32, u64)> = None;
    for (&id, stat) in stats {
        let waste = stat.waste();
        if waste == 0 || stat.used > space {
            continue;
        }
        if best.map_or(true, |(_, best_waste)| waste > best_waste) {
            best = Some((id, waste));
        }
    }
    best.map(|(id, _)| id)
}

/// Points a pass can be cancelled at from tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Usefulness,
    Copy,
    BeforeSwap,
}

pub(crate) struct Compactor<'a> {
    engine: &'a EngineInner,
    token: CancellationToken,
    root: Arc<BTreeRoot>,
    stats: BTreeMap<u32, FileStat>,
    /// `ValueRef::location` in a moved file -> offset in the target file.
    new_positions: HashMap<u64, u32>,
    #[cfg(test)]
    pub(crate) cancel_at: Option<Stage>,
}

impl<'a> Compactor<'a> {
    pub(crate) fn new(engine: &'a EngineInner, token: &CancellationToken) -> Self {
        Self {
            engine,
            token: token.clone(),
            root: engine.last_committed(),
            stats: BTreeMap::new(),
            new_positions: HashMap::new(),
            #[cfg(test)]
            cancel_at: None,
        }
    }

    #[cfg_attr(not(test), allow(unused_variables))]
    fn checkpoint(&self, stage: Stage) -> Result<(), EngineError> {
        #[cfg(test)]
        if self.cancel_at == Some(stage) {
            self.token.cancel();
        }
        self.token.check()
    }

    /// Runs one pass. `Ok(false)` when there was nothing worth doing.
    pub(crate) fn run(mut self) -> Result<bool> {
        if self.engine.files.count() == 0 {
            return Ok(false);
        }
        self.token.check()?;
        self.root = self.engine.last_committed();
        let dont_touch = self.dont_touch_generation();
        self.init_file_stats(dont_touch)?;
        self.calculate_usefulness()?;
        self.checkpoint(Stage::Usefulness)?;

        let waste = total_waste(&self.stats);
        let max = self.engine.config.max_tr_log_file_size;
        if waste < max / 4 {
            debug!(waste, threshold = max / 4, "not enough waste to compact");
            return Ok(false);
        }

        // copy live values of the most wasteful files into one new file
        let (writer, target_id) = self.engine.start_pure_values_file()?;
        let removed = match self.copy_live_values(writer, max) {
            Ok(removed) => removed,
            Err(e) => {
                self.discard_target(target_id);
                return Err(e);
            }
        };

        // Swap: every member pointing at a moved value gets the new location.
        // Not logged; the key index below is the only durable copy.
        let positions = &self.new_positions;
        let token = &self.token;
        let swapped = self.engine.atomically_change_btree(|root| {
            root.remapping_iterate(|member| -> Result<Option<(u32, u32)>> {
                token.check()?;
                let Some(r) = member.value.stored() else {
                    return Ok(None);
                };
                Ok(positions.get(&r.location()).map(|&ofs| (target_id, ofs)))
            })
            .map(|remapped| debug!(remapped, "remapped stored values"))
        });
        let btrees_correct_in = match swapped {
            Ok(id) => id,
            Err(e) => {
                self.discard_target(target_id);
                return Err(e);
            }
        };

        self.engine.create_index_file(&self.token)?;

        // Mark before waiting: a cancelled wait leaves deletion to a later call.

        let mut retire = removed.clone();
        if self.new_positions.is_empty() {
            retire.push(target_id);
        }
        self.engine.mark_as_unknown(&retire, btrees_correct_in);
        self.engine
            .readers
            .wait_until_none_before(btrees_correct_in, &self.token)?;
        let deleted = self.engine.delete_all_unknown_files()?;

        info!(
            target = target_id,
            moved_files = removed.len(),
            moved_values = self.new_positions.len(),
            waste,
            deleted,
            "compaction pass finished"
        );
        Ok(true)
    }

    /// Files of this generation or newer may still receive appends or hold
    /// the root's log position; they are left alone.
    fn dont_touch_generation(&self) -> u64 {
        if let Some(generation) = self.engine.get_generation(self.root.tr_log_file_id()) {
            return generation;
        }
        self.engine
            .log
            .lock()
            .active_file_id()
            .and_then(|id| self.engine.get_generation(id))
            .unwrap_or(u64::MAX)
    }

    fn init_file_stats(&mut self, dont_touch: u64) -> Result<()> {
        for file in self.engine.files.enumerate() {
            if !self
                .engine
                .contains_values_and_does_not_touch_generation(file.id(), dont_touch)
            {
                continue;
            }
            let size = file
                .size()
                .with_context(|| format!("failed to stat file {}", file.id()))?;
            self.stats
                .insert(file.id(), FileStat::new(size.saturating_sub(HEADER_LEN)));
        }
        Ok(())
    }

    fn calculate_usefulness(&mut self) -> Result<(), EngineError> {
        let stats = &mut self.stats;
        let token = &self.token;
        self.root.iterate(|member| {
            token.check()?;
            if let Some(r) = member.value.stored() {
                if let Some(stat) = stats.get_mut(&r.file_id) {
                    stat.used += u64::from(r.stored_len());
                }
            }
            Ok(())
        })
    }

    /// Moves the live values of the most wasteful files, one file at a time,
    /// until nothing else fits. Returns the ids of the emptied files.
    fn copy_live_values(&mut self, mut writer: AppendWriter, max: u64) -> Result<Vec<u32>> {
        let mut removed = Vec::new();
        while let Some(id) = most_wasteful(&self.stats, max.saturating_sub(writer.position())) {
            self.checkpoint(Stage::Copy)?;
            self.move_values_content(&mut writer, id)?;
            self.stats.insert(id, FileStat::default());
            removed.push(id);
        }
        writer
            .hard_flush()
            .context("failed to flush compaction target")?;
        self.checkpoint(Stage::BeforeSwap)?;
        Ok(removed)
    }

    fn move_values_content(&mut self, writer: &mut AppendWriter, file_id: u32) -> Result<()> {
        let file = self.engine.files.file(file_id)?;
        let total = file
            .size()
            .with_context(|| format!("failed to stat file {file_id}"))?;

        let mut blocks: Vec<Vec<u8>> = Vec::new();
        let mut pos = 0u64;
        while pos < total {
            self.token.check()?;
            let len = (total - pos).min(COPY_BLOCK as u64) as usize;
            let mut block = vec![0u8; len];
            file.random_read(&mut block, pos)
                .with_context(|| format!("failed to read file {file_id} at {pos}"))?;
            blocks.push(block);
            pos += len as u64;
        }

        for member in self.root.iter() {
            let Some(r) = member.value.stored() else {
                continue;
            };
            if r.file_id != file_id || self.new_positions.contains_key(&r.location()) {
                continue;
            }
            self.token.check()?;
            let len = u64::from(r.stored_len());
            let start = u64::from(r.offset);
            if start < HEADER_LEN || start + len > total {
                return Err(EngineError::Corruption(format!(
                    "value at {start} (+{len}) lies outside file {file_id} of {total} bytes"
                ))
                .into());
            }
            let new_offset = u32::try_from(writer.position()).map_err(|_| {
                EngineError::ResourceExhausted("compaction target exceeds 4 GiB".into())
            })?;
            let mut at = start;
            let end = start + len;
            while at < end {
                let block = (at / COPY_BLOCK as u64) as usize;
                let in_block = (at % COPY_BLOCK as u64) as usize;
                let take = (COPY_BLOCK - in_block).min((end - at) as usize);
                writer.write_block(&blocks[block][in_block..in_block + take])?;
                at += take as u64;
            }
            self.new_positions.insert(r.location(), new_offset);
        }
        debug!(file_id, "moved live values");
        Ok(())
    }

    fn discard_target(&self, target_id: u32) {
        if let Err(e) = self.engine.files.delete_file(target_id) {
            warn!(file_id = target_id, error = %e, "failed to delete abandoned compaction target");
        }
    }
}

impl EngineInner {
    /// One compaction pass; passes never overlap. A cancelled pass reports
    /// `Ok(false)`.
    pub(crate) fn compact(&self, token: &CancellationToken) -> Result<bool> {
        self.run_compactor(Compactor::new(self, token))
    }

    #[cfg(test)]
    pub(crate) fn compact_cancelling_at(
        &self,
        token: &CancellationToken,
        stage: Stage,
    ) -> Result<bool> {
        let mut compactor = Compactor::new(self, token);
        compactor.cancel_at = Some(stage);
        self.run_compactor(compactor)
    }

    fn run_compactor(&self, compactor: Compactor<'_>) -> Result<bool> {
        let _guard = self.compaction_lock.lock();
        match compactor.run() {
            Err(e) if is_cancelled(&e) => {
                info!("compaction pass cancelled");
                Ok(false)
            }
            other => other,
        }
    }
}
