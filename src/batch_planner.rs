// src/batch_planner.rs
// Splits the address list into fixed-size batches, one remote call each.

use ethers::types::Address;

/// A group of addresses resolved together in one round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Position of this batch in the plan.
    pub id: usize,
    /// Position of each member in the caller's input.
    pub indices: Vec<usize>,
    pub addresses: Vec<Address>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// `(original_index, address)` pairs in batch order.
    pub fn members(&self) -> impl Iterator<Item = (usize, Address)> + '_ {
        self.indices.iter().copied().zip(self.addresses.iter().copied())
    }
}

/// Partition `(original_index, address)` pairs into batches of at most `batch_size`.
/// The last batch may be smaller. A zero `batch_size` is treated as 1.
pub fn plan_batches(items: &[(usize, Address)], batch_size: usize) -> Vec<Batch> {
    let batch_size = batch_size.max(1);

    items
        .chunks(batch_size)
        .enumerate()
        .map(|(id, chunk)| Batch {
            id,
            indices: chunk.iter().map(|(idx, _)| *idx).collect(),
            addresses: chunk.iter().map(|(_, addr)| *addr).collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: usize) -> Vec<(usize, Address)> {
        (0..n)
            .map(|i| (i * 2, Address::from_low_u64_be(i as u64 + 1)))
            .collect()
    }

    #[test]
    fn test_last_batch_holds_remainder() {
        let batches = plan_batches(&items(7), 3);

        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(batches[2].indices, vec![12]);
        assert_eq!(batches.iter().map(|b| b.id).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_original_indices_travel_with_addresses() {
        let input = items(4);
        let batches = plan_batches(&input, 2);

        let flattened: Vec<(usize, Address)> = batches.iter().flat_map(|b| b.members()).collect();
        assert_eq!(flattened, input);
    }

    #[test]
    fn test_empty_input_and_zero_batch_size() {
        assert!(plan_batches(&[], 30).is_empty());
        assert_eq!(plan_batches(&items(3), 0).len(), 3);
    }
}
