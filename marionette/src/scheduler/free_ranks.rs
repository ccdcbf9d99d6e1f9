use crate::comm::Rank;

/// Which scheduler ranks are idle.
///
/// Allocation is first-fit over contiguous runs and nothing is ever moved, so
/// a fragmented pool may refuse a job although enough ranks are idle in total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeRanks {
    free: Vec<bool>,
    /// leading ranks that are never handed out
    reserved: usize,
}

impl FreeRanks {
    /// pool of `size` ranks with the controller (rank 0) reserved
    pub fn new(size: usize) -> Self {
        let mut free = vec![true; size];
        if let Some(controller) = free.first_mut() {
            *controller = false;
        }

        Self {
            free,
            reserved: size.min(1),
        }
    }

    #[cfg(test)]
    pub fn from_flags(free: Vec<bool>) -> Self {
        Self { free, reserved: 0 }
    }

    /// Lowest run of `count` idle ranks as `(first, last)`.
    pub fn first_fit(&self, count: usize) -> Option<(Rank, Rank)> {
        if count == 0 {
            return None;
        }

        let mut start = 0;
        let mut length = 0;
        for (rank, free) in self.free.iter().enumerate() {
            if *free {
                if length == 0 {
                    start = rank;
                }
                length += 1;
                if length == count {
                    return Some((start as Rank, rank as Rank));
                }
            } else {
                length = 0;
            }
        }

        None
    }

    pub fn longest_run(&self) -> usize {
        self.free
            .split(|free| !*free)
            .map(<[bool]>::len)
            .max()
            .unwrap_or(0)
    }

    pub fn occupy(&mut self, first: Rank, last: Rank) {
        self.set(first, last, false);
    }

    pub fn release(&mut self, first: Rank, last: Rank) {
        self.set(first, last, true);
    }

    fn set(&mut self, first: Rank, last: Rank, free: bool) {
        let first = first.max(0) as usize;
        let last = (last.max(-1) + 1) as usize;
        for flag in self.free.iter_mut().take(last).skip(first) {
            *flag = free;
        }
    }

    /// whether any rank that can be handed out is taken
    pub fn any_busy(&self) -> bool {
        self.free.iter().skip(self.reserved).any(|free| !*free)
    }
}
