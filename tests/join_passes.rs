use std::fs;
use std::path::Path;

use pmc_batch::join::table::Table;
use pmc_batch::join::{self, JoinMode, JoinWarning};
use pmc_batch::shorten::{self, Demangler, NameCache, ShortenError};

const HEADER: &str = "Dispatch_ID,GPU_ID,Queue_ID,PID,TID,GRD,WGR,LDS,SCR,Arch_VGPR,ACCUM_VGPR,SGPR,SIG,OBJ,Kernel_Name,Start_Timestamp,End_Timestamp";

const VECADD: &str = "_Z6vecaddIfEvPT_S1_S1_";
const SCALE: &str = "_Z5scaleIdEvPT_";

/// Fixed demangling table standing in for llvm-cxxfilt.
struct FixedDemangler;

impl Demangler for FixedDemangler {
    fn demangle(&self, symbol: &str) -> Result<String, ShortenError> {
        Ok(match symbol {
            VECADD => "void vecadd<float>(float*, float*, float*)".to_string(),
            SCALE => "void scale<double>(double*)".to_string(),
            other => other.to_string(),
        })
    }
}

fn row(dispatch: u32, grd: u32, name: &str, start: u64, end: u64, counter: u64) -> String {
    format!("{dispatch},0,1,4242,4242,{grd},256,0,0,8,0,16,0x1,0x2,{name},{start},{end},{counter}\n")
}

fn write_pass(dir: &Path, pass: usize, counter: &str, rows: &[String]) {
    let mut body = format!("{HEADER},{counter}\n");
    for r in rows {
        body.push_str(r);
    }
    fs::write(dir.join(format!("pmc_perf_{pass}.csv")), body).expect("write pass");
}

#[test]
fn join_workload_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let d = dir.path();

    write_pass(
        d,
        0,
        "SQ_WAVES",
        &[
            row(0, 1024, VECADD, 1_000, 2_000, 64),
            row(1, 64, SCALE, 3_000, 3_500, 8),
            row(2, 1024, VECADD, 5_000, 6_000, 64),
        ],
    );
    write_pass(
        d,
        1,
        "TA_BUSY_cycles",
        &[
            row(7, 1024, VECADD, 11_000, 12_100, 900),
            row(8, 64, SCALE, 13_000, 13_700, 90),
            row(9, 1024, VECADD, 15_000, 16_200, 910),
        ],
    );
    // A third pass that lost the last dispatch truncates the result.
    write_pass(
        d,
        2,
        "TCC_HIT_sum",
        &[
            row(3, 1024, VECADD, 21_000, 22_200, 5),
            row(4, 64, SCALE, 23_000, 23_900, 6),
        ],
    );

    let outcome = join::join_workload(d, JoinMode::Kernel, false).expect("join");

    assert!(outcome.report.warnings.is_empty(), "{:?}", outcome.report.warnings);
    assert_eq!(outcome.inputs.len(), 3);
    assert!(!d.join("pmc_perf_0.csv").exists());

    let unified = Table::read_csv(&d.join(join::UNIFIED_FILE), true).expect("unified");
    assert_eq!(
        unified.headers(),
        [
            "Dispatch_ID",
            "GPU_ID",
            "GRD",
            "WGR",
            "LDS",
            "SCR",
            "Arch_VGPR",
            "ACCUM_VGPR",
            "SGPR",
            "Kernel_Name",
            "SQ_WAVES",
            "TA_BUSY_cycles",
            "TCC_HIT_sum",
            "BeginNs",
            "EndNs",
        ]
    );
    assert_eq!(unified.len(), 2);
    assert_eq!(unified.column("Dispatch_ID").expect("ids"), ["0", "1"]);
    assert_eq!(unified.column("BeginNs").expect("begin"), ["11000", "13000"]);
    assert_eq!(unified.column("EndNs").expect("end"), ["12100", "13700"]);

    // Shortening only targets Name/KernelName columns, so the unified
    // table is left as written.
    let mut cache = NameCache::new();
    let summary = shorten::shorten_workload(d, 1, &FixedDemangler, &mut cache).expect("shorten");
    assert!(summary.rewritten.is_empty());
    assert_eq!(summary.skipped, [d.join(join::UNIFIED_FILE)]);
}

#[test]
fn shorten_kernel_name_column() {
    let dir = tempfile::tempdir().expect("tempdir");
    let d = dir.path();
    fs::write(
        d.join("results_SQ_WAVES.csv"),
        format!("Index,KernelName,SQ_WAVES\n0,{VECADD},64\n1,{SCALE},8\n2,{VECADD},64\n"),
    )
    .expect("write");

    let mut cache = NameCache::new();
    let summary = shorten::shorten_workload(d, 1, &FixedDemangler, &mut cache).expect("shorten");

    assert!(summary.is_success());
    assert_eq!(cache.len(), 2);
    let table = Table::read_csv(&d.join("results_SQ_WAVES.csv"), true).expect("read");
    assert_eq!(
        table.column("KernelName").expect("names"),
        [
            "void vecadd(float*, float*, float*)",
            "void scale(double*)",
            "void vecadd(float*, float*, float*)",
        ]
    );
}

#[test]
fn grid_mode_separates_launch_shapes() {
    let pass = |counter: &str, grds: [u32; 2]| {
        let mut body = format!("{HEADER},{counter}\n");
        for (i, grd) in grds.iter().enumerate() {
            body.push_str(&row(i as u32, *grd, VECADD, 100, 200, 1));
        }
        Table::from_reader(body.as_bytes(), Path::new("pass.csv"), true).expect("pass")
    };

    // Pass 1 captured the launches in the opposite order.
    let tables = vec![pass("SQ_WAVES", [64, 1024]), pass("TA_BUSY", [1024, 64])];

    let by_kernel = join::join_tables(tables.clone(), JoinMode::Kernel).expect("kernel join");
    assert_eq!(by_kernel.table.len(), 2);
    assert!(by_kernel.warnings.contains(&JoinWarning::FieldMismatch {
        field: "GRD".to_string()
    }));

    let by_grid = join::join_tables(tables, JoinMode::Grid).expect("grid join");
    assert_eq!(by_grid.table.len(), 2);
    assert!(by_grid.warnings.is_empty());
    assert_eq!(by_grid.table.column("GRD").expect("grd"), ["64", "1024"]);
}
