use std::collections::HashMap;
use std::fs;
use std::path::Path;

use pmc_batch::perfmon::line::parse_lines;
use pmc_batch::perfmon::plan::{check_capacity, Pass};
use pmc_batch::perfmon::{self, FilterRequest};
use pmc_batch::soc::CapacityTable;

fn write(path: &Path, body: &str) {
    fs::create_dir_all(path.parent().expect("parent")).expect("create dir");
    fs::write(path, body).expect("write");
}

fn reference_tree(root: &Path) {
    write(
        &root.join("pmc_kernel_top_perf.txt"),
        "# kernel timing\npmc: GRBM_COUNT GRBM_GUI_ACTIVE\n",
    );
    let sq: Vec<String> = (0..11).map(|i| format!("SQ_C{i:02}")).collect();
    write(
        &root.join("mi200/pmc_sq_perf1.txt"),
        &format!(
            "pmc: {}\npmc: SQ_LEVEL_WAVES SQ_ACCUM_PREV_HIRES\npmc: SQC_ICACHE_HITS\n",
            sq.join(" ")
        ),
    );
    write(
        &root.join("mi200/pmc_tcc_perf.txt"),
        "pmc: TCC_HIT_sum TCC_MISS_sum TCC_EA_RDREQ_sum TCC_EA_WRREQ_sum TCC_REQ_sum\n\
         pmc: TCC_HIT[0] TCC_HIT[1] TCC_MISS[0] TCC_MISS[1] TCC_EA_RDREQ[0]\n",
    );
    write(&root.join("mi200/pmc_ta_perf.txt"), "pmc: TA_BUSY_cycles TA_FLAT_WAVEFRONTS TA_TA_BUSY\n");
    write(&root.join("roofline/pmc_roof_perf.txt"), "pmc: SQ_INSTS_VALU SQ_INSTS_SALU\n");
}

fn pass_counters(perfmon_out: &Path, passes: usize) -> Vec<Pass> {
    (0..passes)
        .map(|i| {
            let body = fs::read_to_string(perfmon_out.join(format!("pmc_perf_{i}.txt")))
                .expect("pass file");
            assert!(body.ends_with("\ngpu:\nrange:\nkernel:\n"));
            let lines = parse_lines(&body);
            assert_eq!(lines.len(), 1);
            Pass {
                counters: lines.into_iter().next().expect("line").counters,
            }
        })
        .collect()
}

#[test]
fn plan_pipeline_places_every_counter_once_within_capacity() {
    let refs = tempfile::tempdir().expect("tempdir");
    let out = tempfile::tempdir().expect("tempdir");
    reference_tree(refs.path());
    let workload = out.path().join("app");

    let table = CapacityTable::builtin();
    let soc = table.get("mi200").expect("mi200");

    let result = perfmon::filter_workload(&FilterRequest {
        perfmon_dir: refs.path(),
        workload_dir: &workload,
        soc,
        ip_blocks: None,
        split_passes: true,
    })
    .expect("filter workload");

    // SQ: 12 counters at capacity 8; TCC: 5 aggregate (2 passes) then
    // channels of at most 3 (1 pass).
    assert_eq!(result.plan.len(), 3);
    assert_eq!(result.pass_files.len(), 3);
    assert_eq!(result.levels.len(), 1);

    let perfmon_out = workload.join("perfmon");
    assert!(!perfmon_out.join("pmc_perf.txt").exists());
    assert!(perfmon_out.join("timestamps.txt").exists());
    assert_eq!(
        fs::read_to_string(perfmon_out.join("SQ_LEVEL_WAVES.txt")).expect("level file"),
        "pmc: SQ_LEVEL_WAVES SQ_ACCUM_PREV_HIRES\n\ngpu:\nrange:\nkernel:\n"
    );

    let passes = pass_counters(&perfmon_out, result.plan.len());
    let mut seen: HashMap<String, usize> = HashMap::new();
    for (i, pass) in passes.iter().enumerate() {
        check_capacity(i, pass, soc).expect("pass within capacity");
        for c in &pass.counters {
            *seen.entry(c.clone()).or_default() += 1;
        }
    }
    assert_eq!(seen.len(), 12 + 2 + 5 + 5 + 3);
    assert!(seen.values().all(|n| *n == 1));
    assert!(!seen.contains_key("SQ_LEVEL_WAVES"));
    assert!(!seen.contains_key("SQ_ACCUM_PREV_HIRES"));

    // Channel counters only appear once the aggregate list is exhausted.
    assert!(passes[2].counters.contains(&"TCC_HIT[0]".to_string()));
    assert!(passes[1].counters.contains(&"TCC_REQ_sum".to_string()));
}

#[test]
fn plan_pipeline_rerun_replaces_prior_outputs() {
    let refs = tempfile::tempdir().expect("tempdir");
    let out = tempfile::tempdir().expect("tempdir");
    reference_tree(refs.path());
    let workload = out.path().join("app");
    let table = CapacityTable::builtin();
    let soc = table.get("mi200").expect("mi200");

    perfmon::filter_workload(&FilterRequest {
        perfmon_dir: refs.path(),
        workload_dir: &workload,
        soc,
        ip_blocks: None,
        split_passes: true,
    })
    .expect("run A");
    write(&workload.join("pmc_perf_0.csv"), "stale");

    let allow = vec!["ta".to_string()];
    let result = perfmon::filter_workload(&FilterRequest {
        perfmon_dir: refs.path(),
        workload_dir: &workload,
        soc,
        ip_blocks: Some(&allow),
        split_passes: true,
    })
    .expect("run B");

    assert_eq!(result.selection.included.len(), 1);
    assert_eq!(result.selection.excluded.len(), 3);
    assert_eq!(result.plan.len(), 2);
    assert!(!workload.join("pmc_perf_0.csv").exists());
    assert!(!workload.join("perfmon/SQ_LEVEL_WAVES.txt").exists());
    assert!(!workload.join("perfmon/pmc_perf_2.txt").exists());

    let mut names: Vec<String> = fs::read_dir(workload.join("perfmon"))
        .expect("read perfmon")
        .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, ["pmc_perf_0.txt", "pmc_perf_1.txt", "timestamps.txt"]);
}

#[test]
fn plan_pipeline_roofline_keeps_workload_content() {
    let refs = tempfile::tempdir().expect("tempdir");
    let out = tempfile::tempdir().expect("tempdir");
    reference_tree(refs.path());
    let workload = out.path().join("app");
    write(&workload.join("sysinfo.csv"), "gpu_arch\ngfx90a\n");

    let table = CapacityTable::builtin();
    let soc = table.get("mi200").expect("mi200");
    let result = perfmon::roofline_workload(refs.path(), &workload, soc, false).expect("roofline");

    assert_eq!(result.plan.len(), 1);
    assert!(workload.join("sysinfo.csv").exists());
    assert_eq!(
        fs::read_to_string(workload.join("perfmon/pmc_perf.txt")).expect("plan file"),
        "pmc: SQ_INSTS_VALU SQ_INSTS_SALU\n\ngpu:\nrange:\nkernel:\n"
    );
}
