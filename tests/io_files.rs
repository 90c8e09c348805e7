use argthread_rs::io::fasta::{read_fasta, write_fasta};
use argthread_rs::io::params::{load_model, load_params};
use argthread_rs::io::sites::{read_sites, write_sites};
use argthread_rs::model::ArgModel;
use argthread_rs::sequences::{Sequences, make_sequences_from_sites, make_sites_from_sequences};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_path(prefix: &str, ext: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before unix epoch")
        .as_nanos();
    path.push(format!("{prefix}_{}_{}.{}", std::process::id(), nanos, ext));
    path
}

#[test]
fn fasta_round_trip_preserves_sequences() {
    let path = unique_temp_path("argthread_fasta", "fa");
    let mut seqs = Sequences::new();
    seqs.append("chr_a".to_string(), b"ACGTN".to_vec()).unwrap();
    seqs.append("chr_b".to_string(), b"acgtn".to_vec()).unwrap();
    write_fasta(&path, &seqs).expect("write failed");

    let back = read_fasta(&path).expect("read failed");
    assert_eq!(back.names, seqs.names);
    assert_eq!(back.seqs, seqs.seqs);
    assert_eq!(back.length(), 5);

    let _ = fs::remove_file(path);
}

#[test]
fn fasta_reads_gzipped_and_multiline_bodies() {
    let path = unique_temp_path("argthread_fasta_gz", "fa.gz");
    let file = fs::File::create(&path).expect("failed to create gz path");
    let mut writer = GzEncoder::new(file, Compression::default());
    writer
        .write_all(b">s1\nACG\nT\n>s2\nNNNN\n")
        .expect("failed to write gz data");
    writer.finish().expect("failed to finish gzip stream");

    let seqs = read_fasta(&path).expect("read failed");
    assert_eq!(seqs.nseqs(), 2);
    assert_eq!(seqs.seqs[0], b"ACGT".to_vec());
    assert_eq!(seqs.seqs[1], b"NNNN".to_vec());

    let _ = fs::remove_file(path);
}

#[test]
fn fasta_rejects_unequal_lengths() {
    let path = unique_temp_path("argthread_fasta_bad", "fa");
    fs::write(&path, ">a\nACGT\n>b\nAC\n").expect("write failed");
    let err = read_fasta(&path).expect_err("expected length mismatch");
    assert!(err.to_string().contains("length"));
    let _ = fs::remove_file(path);
}

#[test]
fn sites_round_trip_and_expansion() {
    let path = unique_temp_path("argthread_sites", "sites");
    fs::write(
        &path,
        "NAMES\ta\tb\tc\nREGION\tchr1\t1\t10\n3\tACA\n7\tGGT\n",
    )
    .expect("write failed");

    let sites = read_sites(&path).expect("read failed");
    assert_eq!(sites.chrom, "chr1");
    assert_eq!(sites.start_coord, 0);
    assert_eq!(sites.end_coord, 10);
    assert_eq!(sites.positions, vec![2, 6]);
    assert_eq!(sites.nsites(), 2);

    let seqs = make_sequences_from_sites(&sites, b'A').expect("expansion failed");
    assert_eq!(seqs.nseqs(), 3);
    assert_eq!(seqs.length(), 10);
    assert_eq!(seqs.seqs[2][2], b'A');
    assert_eq!(seqs.seqs[2][6], b'T');

    // collapse back to variant columns only
    let sites2 = make_sites_from_sequences(&seqs, "chr1").expect("collapse failed");
    assert_eq!(sites2.positions, vec![2, 6]);

    let out = unique_temp_path("argthread_sites_out", "sites");
    write_sites(&out, &sites).expect("write failed");
    let back = read_sites(&out).expect("re-read failed");
    assert_eq!(back.positions, sites.positions);
    assert_eq!(back.cols, sites.cols);

    let _ = fs::remove_file(path);
    let _ = fs::remove_file(out);
}

#[test]
fn sites_rejects_malformed_rows() {
    let path = unique_temp_path("argthread_sites_bad", "sites");
    fs::write(&path, "NAMES\ta\tb\nREGION\tchr1\t1\t10\n3\tAXA\n").expect("write failed");
    let err = read_sites(&path).expect_err("expected bad row");
    assert!(err.to_string().contains("line 3"));
    let _ = fs::remove_file(path);
}

#[test]
fn model_params_round_trip() {
    let path = unique_temp_path("argthread_params", "json");
    let model = ArgModel::new(8, 200_000.0, 0.01, 10_000.0, 1.5e-8, 2.5e-8).unwrap();
    model.save_params(&path).expect("save failed");

    let params = load_params(&path).expect("load failed");
    assert_eq!(params.times.len(), 8);
    assert_eq!(params.rho, model.rho);

    let back = load_model(&path).expect("model load failed");
    assert_eq!(back.ntimes, model.ntimes);
    assert_eq!(back.times, model.times);
    assert_eq!(back.popsizes, model.popsizes);
    assert_eq!(back.mintime, model.mintime);

    let _ = fs::remove_file(path);
}
