//! Instruction coalescing.

use std::collections::HashMap;
use std::path::Path;

use crate::FileInstruction;

/// Reduce one drain cycle's batch to at most one instruction per path.
///
/// For each path the last recorded instruction wins, and survivors keep the
/// position of the path's first occurrence, so a directory created before the
/// files inside it is still applied first. An empty batch yields an empty
/// result.
pub fn coalesce(batch: Vec<FileInstruction>) -> Vec<FileInstruction> {
    // order[slot] is the index of the winning instruction for the slot's path
    let order = {
        let mut slots: HashMap<&Path, usize> = HashMap::with_capacity(batch.len());
        let mut order: Vec<usize> = Vec::with_capacity(batch.len());

        for (index, instruction) in batch.iter().enumerate() {
            match slots.get(instruction.file.as_path()) {
                Some(&slot) => order[slot] = index,
                None => {
                    slots.insert(instruction.file.as_path(), order.len());
                    order.push(index);
                }
            }
        }
        order
    };

    let mut batch: Vec<Option<FileInstruction>> = batch.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|index| batch[index].take())
        .collect()
}
