use super::free_ranks::FreeRanks;

#[test]
pub fn first_fit_takes_lowest_run() {
    let ranks = FreeRanks::from_flags(vec![true, true, false, true, true, true, false]);
    assert_eq!(ranks.first_fit(3), Some((3, 5)));
    assert_eq!(ranks.first_fit(2), Some((0, 1)));
    assert_eq!(ranks.first_fit(4), None);
    assert_eq!(ranks.longest_run(), 3);
}

#[test]
pub fn controller_is_reserved() {
    let mut ranks = FreeRanks::new(5);
    assert!(!ranks.any_busy());
    assert_eq!(ranks.longest_run(), 4);
    assert_eq!(ranks.first_fit(4), Some((1, 4)));
    assert_eq!(ranks.first_fit(5), None);

    ranks.occupy(1, 4);
    assert!(ranks.any_busy());
    assert_eq!(ranks.first_fit(1), None);
    assert_eq!(ranks.longest_run(), 0);

    ranks.release(1, 4);
    assert!(!ranks.any_busy());
}

#[test]
pub fn fragmentation_is_not_compacted() {
    let mut ranks = FreeRanks::new(7);
    ranks.occupy(3, 3);
    ranks.occupy(6, 6);

    // four idle ranks in total, but no run of three
    assert_eq!(ranks.first_fit(3), None);
    assert_eq!(ranks.first_fit(2), Some((1, 2)));
    assert_eq!(ranks.first_fit(0), None);
}
