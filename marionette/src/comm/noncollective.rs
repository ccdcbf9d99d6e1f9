//! Communicator creation that only involves the member ranks.
//!
//! `MPI_Comm_create` needs every rank of the parent to take part, which is
//! impossible while other parts of the parent are busy running jobs. Instead
//! every member starts from a one-member communicator and groups are merged
//! pairwise, doubling in size each round, until one communicator spans the
//! whole member list.

use super::{CommError, Communicator, Rank, Tag};
use tracing::{debug, instrument};

/// Build a communicator over `members` (ranks of `parent`, in the order they
/// should appear) with only those ranks calling. Ranks of the result equal
/// positions in `members`.
#[instrument(skip(parent, members), fields(members = members.len()))]
pub fn create_from_ranks<C: Communicator>(parent: &C, members: &[Rank], tag: Tag) -> Result<C, CommError> {
    let me = parent.rank();
    let group_rank = members
        .iter()
        .position(|member| *member == me)
        .ok_or(CommError::NotAMember(me))?;
    let total = members.len();

    let mut comm = parent.solo()?;
    let mut merge_size = 1;
    let mut rounds = 0;

    while merge_size < total {
        let group_id = group_rank / merge_size;

        let bridge = if group_id % 2 == 0 {
            let partner = (group_id + 1) * merge_size;
            if partner < total {
                Some((comm.intercomm_create(0, parent, members[partner], tag)?, false))
            } else {
                // no partner this round, the group carries over unchanged
                None
            }
        } else {
            let partner = (group_id - 1) * merge_size;
            Some((comm.intercomm_create(0, parent, members[partner], tag)?, true))
        };

        if let Some((inter, high)) = bridge {
            comm = inter.merge(high)?;
        }

        merge_size *= 2;
        rounds += 1;
    }

    debug!(rounds, rank = comm.rank(), "Non-collective communicator ready");

    Ok(comm)
}
