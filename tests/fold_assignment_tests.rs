// tests/fold_assignment_tests.rs - Stratified fold assignment properties
use logit_stack::stacking::data::FoldAssignment;

fn labels(counts: &[usize]) -> Vec<usize> {
    // interleave classes so input order says nothing about the label
    let mut out = Vec::new();
    let max = counts.iter().copied().max().unwrap_or(0);
    for i in 0..max {
        for (class, &count) in counts.iter().enumerate() {
            if i < count {
                out.push(class);
            }
        }
    }
    out
}

#[test]
fn test_same_seed_same_assignment() {
    let labels = labels(&[40, 13, 27, 9, 61]);
    let a = FoldAssignment::stratified(&labels, 5, 42).unwrap();
    let b = FoldAssignment::stratified(&labels, 5, 42).unwrap();
    assert_eq!(a, b);

    let c = FoldAssignment::stratified(&labels, 5, 43).unwrap();
    assert_ne!(a, c, "a different seed should reshuffle the groups");
}

#[test]
fn test_folds_partition_every_example() {
    let labels = labels(&[40, 13, 27, 9, 61]);
    let folds = FoldAssignment::stratified(&labels, 5, 7).unwrap();

    let mut seen: Vec<usize> = (0..5).flat_map(|f| folds.fold_indices(f)).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..labels.len()).collect::<Vec<_>>());

    let sizes = folds.fold_sizes();
    assert_eq!(sizes.iter().sum::<usize>(), labels.len());
    let (min, max) = (sizes.iter().min().unwrap(), sizes.iter().max().unwrap());
    assert!(max - min <= 1, "fold sizes {sizes:?} differ by more than one");
}

#[test]
fn test_each_fold_is_stratified() {
    let counts = [40, 13, 27, 9, 61];
    let labels = labels(&counts);
    let folds = FoldAssignment::stratified(&labels, 5, 42).unwrap();

    for (class, &count) in counts.iter().enumerate() {
        let per_fold: Vec<usize> = (0..5)
            .map(|f| folds.label_counts(&labels, f).get(&class).copied().unwrap_or(0))
            .collect();
        assert_eq!(per_fold.iter().sum::<usize>(), count);
        let (min, max) = (per_fold.iter().min().unwrap(), per_fold.iter().max().unwrap());
        assert!(max - min <= 1, "class {class} spread {per_fold:?}");
    }
}

#[test]
fn test_rejects_degenerate_fold_counts() {
    assert!(FoldAssignment::stratified(&[0, 1, 2], 1, 0).is_err());
    assert!(FoldAssignment::stratified(&[0, 1, 2], 4, 0).is_err());
}
