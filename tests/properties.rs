use ahash::AHashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use georecon::{
    ControlTarget, ControlTotalScaler, GeoKey, GeoKeyDeriver, KeyWidths, ParentMap, Resolution,
    VariableGroup, VariableTable, compute_shares, disaggregate, reconcile_to_total,
    round_half_even,
};

const BLOCK_GROUPS: [&str; 5] = [
    "060010001001",
    "060010001002",
    "060010001003",
    "060410002001",
    "060410002002",
];

fn random_blocks(rng: &mut StdRng) -> VariableTable {
    let mut keys = Vec::new();
    let mut pop = Vec::new();
    for (g, bg) in BLOCK_GROUPS.iter().enumerate() {
        for j in 0..rng.gen_range(1..12) {
            keys.push(GeoKey::new(format!("{bg}{j:03}")));
            // last block group is entirely unpopulated
            let p = if g == BLOCK_GROUPS.len() - 1 || rng.gen_bool(0.2) {
                0.0
            } else {
                rng.gen_range(1.0..500.0)
            };
            pop.push(p);
        }
    }
    VariableTable::new("blocks", Resolution::Block, keys)
        .unwrap()
        .with_column("pop", pop)
        .unwrap()
}

fn block_group_totals(blocks: &VariableTable, column: &str) -> AHashMap<String, f64> {
    let values = blocks.column(column).unwrap();
    let mut totals = AHashMap::new();
    for (key, v) in blocks.keys().iter().zip(values.iter()) {
        *totals.entry(key.as_str()[..12].to_string()).or_insert(0.0) += v;
    }
    totals
}

#[test]
fn shares_sum_to_one_per_populated_parent() {
    let deriver = GeoKeyDeriver::new(KeyWidths::default());
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..50 {
        let blocks = random_blocks(&mut rng);
        let map =
            ParentMap::from_prefix(blocks.keys(), Resolution::Block, Resolution::BlockGroup, &deriver)
                .unwrap();
        let (shares, report) = compute_shares(&blocks, "pop", &map).unwrap();
        assert_eq!(report.missing_children, 0);

        let weight = block_group_totals(&blocks, "pop");
        for (parent, sum) in shares.parent_sums() {
            if weight[parent.as_str()] > 0.0 {
                assert!((sum - 1.0).abs() <= 1e-9, "{parent}: {sum}");
            } else {
                assert_eq!(sum, 0.0);
            }
        }
    }
}

#[test]
fn disaggregation_conserves_parent_values() {
    let deriver = GeoKeyDeriver::new(KeyWidths::default());
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..50 {
        let blocks = random_blocks(&mut rng);
        let tothh: Vec<f64> = BLOCK_GROUPS.iter().map(|_| rng.gen_range(0.0..2000.0)).collect();
        let parents = VariableTable::new(
            "bg",
            Resolution::BlockGroup,
            BLOCK_GROUPS.iter().map(|&k| GeoKey::from(k)).collect(),
        )
        .unwrap()
        .with_column("tothh", tothh.clone())
        .unwrap();

        let map =
            ParentMap::from_prefix(blocks.keys(), Resolution::Block, Resolution::BlockGroup, &deriver)
                .unwrap();
        let (shares, _) = compute_shares(&blocks, "pop", &map).unwrap();
        let (children, report) = disaggregate(&parents, &shares, &["tothh"]).unwrap();
        assert_eq!(report.orphaned, 0);

        let weight = block_group_totals(&blocks, "pop");
        let pushed = block_group_totals(&children, "tothh");
        for (bg, expected) in BLOCK_GROUPS.iter().zip(&tothh) {
            if weight[*bg] > 0.0 {
                assert!((pushed[*bg] - expected).abs() < 1e-6, "{bg}");
            } else {
                assert_eq!(pushed[*bg], 0.0);
            }
        }
    }
}

#[test]
fn rounding_hits_the_total_without_negatives() {
    let mut rng = StdRng::seed_from_u64(3);
    for _ in 0..5000 {
        let n = rng.gen_range(1..9);
        let partials: Vec<f64> = (0..n)
            .map(|_| {
                if rng.gen_bool(0.25) {
                    0.0
                } else {
                    rng.gen_range(0.0..60.0)
                }
            })
            .collect();
        let target = rng.gen_range(0..400);
        let r = reconcile_to_total(target, &partials);
        assert_eq!(r.values.iter().sum::<i64>(), target, "{partials:?} -> {target}");
        assert!(r.values.iter().all(|&q| q >= 0), "{partials:?} -> {:?}", r.values);
    }
}

struct GroupCase {
    table: VariableTable,
    targets: ControlTarget,
}

fn group() -> VariableGroup {
    VariableGroup::new("emp", "emp", ["emp_a", "emp_b", "emp_c"]).unwrap()
}

fn random_case(rng: &mut StdRng) -> GroupCase {
    let counties = ["Alameda", "Marin", "Napa", "Solano"];
    let rows = 30;
    let mut label = Vec::with_capacity(rows);
    let mut parts: [Vec<f64>; 3] = Default::default();
    let mut sum = Vec::with_capacity(rows);
    for _ in 0..rows {
        label.push(counties[rng.gen_range(0..counties.len())].to_string());
        let mut total = 0.0;
        for col in parts.iter_mut() {
            let v = if rng.gen_bool(0.3) {
                0.0
            } else {
                rng.gen_range(0..300) as f64
            };
            col.push(v);
            total += v;
        }
        sum.push(total);
    }
    let keys = (0..rows).map(|i| GeoKey::new(format!("{}", 100 + i))).collect();
    let [a, b, c] = parts;
    let table = VariableTable::new("taz", Resolution::Taz, keys)
        .unwrap()
        .with_label("county", label)
        .unwrap()
        .with_column("emp", sum)
        .unwrap()
        .with_column("emp_a", a)
        .unwrap()
        .with_column("emp_b", b)
        .unwrap()
        .with_column("emp_c", c)
        .unwrap();
    // Solano stays untargeted
    let targets = ControlTarget::from_values(
        "emp_target",
        counties[..3]
            .iter()
            .map(|c| (c.to_string(), rng.gen_range(0..20000) as f64)),
    )
    .unwrap();
    GroupCase { table, targets }
}

#[test]
fn every_row_keeps_its_group_sum_after_scaling() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..200 {
        let case = random_case(&mut rng);
        let (out, _) = ControlTotalScaler::default()
            .scale_to_target(&case.table, &group(), &case.targets, "county")
            .unwrap();
        assert!(group().violations(&out).unwrap().is_empty());

        for (unit, rows) in out.rows_by_label("county").unwrap() {
            let Some(target) = case.targets.target(unit, "emp_target").unwrap() else {
                continue;
            };
            let before: f64 = rows.iter().map(|&r| case.table.column("emp").unwrap()[r]).sum();
            let after: f64 = rows.iter().map(|&r| out.column("emp").unwrap()[r]).sum();
            if before == 0.0 || (target / before - 1.0).abs() < 1e-4 {
                assert_eq!(after, before);
            } else {
                assert_eq!(after, round_half_even(target) as f64, "{unit}");
            }
        }
    }
}

#[test]
fn scaling_twice_to_a_met_target_changes_nothing() {
    let mut rng = StdRng::seed_from_u64(5);
    let scaler = ControlTotalScaler::default();
    for _ in 0..100 {
        let case = random_case(&mut rng);
        let (once, _) = scaler
            .scale_to_target(&case.table, &group(), &case.targets, "county")
            .unwrap();
        let (twice, report) = scaler
            .scale_to_target(&once, &group(), &case.targets, "county")
            .unwrap();
        assert_eq!(report.scaled_units, 0);
        assert_eq!(twice, once);
    }
}
