use super::{
    noncollective,
    thread::{self, Aborted},
    CommError, Communicator,
};

#[test]
pub fn point_to_point_is_fifo_per_tag() {
    let received = thread::run(2, |comm| {
        if comm.rank() == 0 {
            comm.send_i32s(1, 7, &[1]).unwrap();
            comm.send_i32s(1, 8, &[99]).unwrap();
            comm.send_i32s(1, 7, &[2]).unwrap();
            Vec::new()
        } else {
            let (first, _) = comm.recv_i32s(Some(0), Some(7)).unwrap();
            let (second, _) = comm.recv_i32s(Some(0), Some(7)).unwrap();
            let (other, status) = comm.recv_i32s(None, None).unwrap();
            assert_eq!(status.tag, 8);
            assert_eq!(status.source, 0);
            vec![first[0], second[0], other[0]]
        }
    })
    .unwrap();

    assert_eq!(received[1], vec![1, 2, 99]);
}

#[test]
pub fn iprobe_does_not_consume() {
    thread::run(2, |comm| {
        if comm.rank() == 0 {
            comm.send_str(1, 3, "hello").unwrap();
            comm.barrier().unwrap();
        } else {
            comm.barrier().unwrap();
            let status = comm.iprobe(None, Some(3)).unwrap().unwrap();
            assert_eq!(status.count, 5);
            assert!(comm.iprobe(None, Some(4)).unwrap().is_none());
            let (text, _) = comm.recv_string(Some(0), Some(3)).unwrap();
            assert_eq!(text, "hello");
            assert!(comm.iprobe(None, None).unwrap().is_none());
        }
    })
    .unwrap();
}

#[test]
pub fn broadcast_and_dup() {
    let values = thread::run(4, |comm| {
        let mut data = if comm.rank() == 2 { vec![4, 2] } else { Vec::new() };
        comm.broadcast(2, &mut data).unwrap();

        // a duplicate does not see traffic of the original
        let dup = comm.dup().unwrap();
        if comm.rank() == 0 {
            comm.send(1, 0, b"original").unwrap();
            dup.send(1, 0, b"dup").unwrap();
        }
        if comm.rank() == 1 {
            let (payload, _) = dup.recv(Some(0), Some(0)).unwrap();
            assert_eq!(payload, b"dup");
            let (payload, _) = comm.recv(Some(0), Some(0)).unwrap();
            assert_eq!(payload, b"original");
        }
        data
    })
    .unwrap();

    assert!(values.iter().all(|data| data == &[4, 2]));
}

#[test]
pub fn split_orders_by_key() {
    let layout = thread::run(5, |comm| {
        let color = if comm.rank() == 4 { None } else { Some(comm.rank() % 2) };
        let key = -comm.rank();
        comm.split(color, key)
            .unwrap()
            .map(|local| (local.rank(), local.size()))
    })
    .unwrap();

    // even ranks 0 and 2, odd ranks 1 and 3, each reversed by key
    assert_eq!(layout, vec![Some((1, 2)), Some((1, 2)), Some((0, 2)), Some((0, 2)), None]);
}

#[test]
pub fn intercomm_and_merge() {
    let merged = thread::run(5, |world| {
        let low = world.rank() < 2;
        let local = world.split(Some(low as i32), world.rank()).unwrap().unwrap();
        let remote_leader = if low { 2 } else { 0 };

        let inter = local.intercomm_create(0, &world, remote_leader, 11).unwrap();
        assert!(inter.is_inter());
        assert_eq!(inter.remote_size(), if low { 3 } else { 2 });
        assert_eq!(inter.barrier(), Err(CommError::NotIntra));

        if low && local.rank() == 0 {
            inter.send_i32s(2, 1, &[42]).unwrap();
        }
        if !low && local.rank() == 2 {
            let (value, status) = inter.recv_i32s(None, Some(1)).unwrap();
            assert_eq!((value[0], status.source), (42, 0));
        }

        // the group that is not high comes first
        let intra = inter.merge(!low).unwrap();
        assert_eq!(intra.size(), 5);
        intra.barrier().unwrap();
        intra.rank()
    })
    .unwrap();

    assert_eq!(merged, vec![0, 1, 2, 3, 4]);
}

#[test]
pub fn translate_between_communicators() {
    thread::run(4, |world| {
        let upper = world.split(Some((world.rank() >= 2) as i32), 0).unwrap().unwrap();
        let translated = upper.translate_ranks(&[0, 1], &world).unwrap();
        if world.rank() >= 2 {
            assert_eq!(translated, vec![Some(2), Some(3)]);
        } else {
            assert_eq!(translated, vec![Some(0), Some(1)]);
        }

        let solo = world.solo().unwrap();
        assert_eq!((solo.rank(), solo.size()), (0, 1));
        assert_eq!(world.translate_ranks(&[3], &solo).unwrap()[0], (world.rank() == 3).then_some(0));
        assert_eq!(
            world.translate_ranks(&[4], &solo),
            Err(CommError::RankOutOfRange { rank: 4, size: 4 })
        );
    })
    .unwrap();
}

#[test]
pub fn noncollective_over_a_subset() {
    let ranks = thread::run(7, |world| {
        let members = [1, 2, 3, 5, 6];
        if !members.contains(&world.rank()) {
            return None;
        }

        let comm = noncollective::create_from_ranks(&world, &members, 77).unwrap();
        let mut data = if comm.rank() == 0 { vec![9] } else { Vec::new() };
        comm.broadcast(0, &mut data).unwrap();
        assert_eq!(data, vec![9]);
        assert_eq!(comm.size(), 5);
        Some(comm.rank())
    })
    .unwrap();

    assert_eq!(ranks, vec![None, Some(0), Some(1), Some(2), None, Some(3), Some(4)]);
}

#[test]
pub fn noncollective_rejects_outsiders() {
    thread::run(2, |world| {
        if world.rank() == 1 {
            assert_eq!(
                noncollective::create_from_ranks(&world, &[0], 77).err(),
                Some(CommError::NotAMember(1))
            );
        } else {
            let comm = noncollective::create_from_ranks(&world, &[0], 77).unwrap();
            assert_eq!(comm.size(), 1);
        }
    })
    .unwrap();
}

#[test]
pub fn abort_unblocks_every_rank() {
    let outcome = std::panic::catch_unwind(|| {
        thread::run(3, |comm| {
            if comm.rank() == 0 {
                comm.abort(3);
            }
            // never satisfied, the abort has to wake us
            let _ = comm.recv(Some(0), Some(1));
        })
    });

    let payload = outcome.err().unwrap();
    assert_eq!(payload.downcast_ref::<Aborted>().map(|aborted| aborted.code), Some(3));
}
