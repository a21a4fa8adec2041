use dz_lib::cli::{CompressConfig, DecompressConfig, QualityMode, StreamBackend};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const REFERENCE: &str = "\
>chr1 test chromosome\n\
ACGTACGTACGTACGTACGT\n\
ACGTACGTACGTACGTACGT\n\
>chr2\n\
TTTTGGGGCCCCAAAATTTTGGGGCCCCAAAA\n";

/// Coordinate-sorted alignments on two chromosomes plus one unplaced read.
const SAM_DATA: &str = "\
@HD\tVN:1.6\tSO:coordinate\n\
@SQ\tSN:chr1\tLN:40\n\
@SQ\tSN:chr2\tLN:32\n\
@RG\tID:grp1\n\
r001\t99\tchr1\t1\t60\t8M\t=\t11\t18\tACGTACGT\tIIIIIIII\tRG:Z:grp1\tNM:i:0\tMD:Z:8\n\
r002\t0\tchr1\t3\t60\t4M1I3M\t*\t0\t0\tGTACTGTA\tHHHHGGGG\tRG:Z:grp1\tNM:i:1\tMD:Z:7\n\
r003\t147\tchr1\t11\t60\t8M\t=\t1\t-18\tGTACTTAC\tIIIIIIII\tRG:Z:grp1\tNM:i:1\tMD:Z:4G3\tXD:Z:4G3\n\
r003b\t163\tchr1\t12\t60\t7M\t=\t20\t15\tTACTTAC\tIIIIIII\tRG:Z:grp2\tAS:i:-300\n\
r004\t0\tchr1\t15\t0\t5M\t*\t0\t0\tgtacn\t*\n\
r005\t16\tchr2\t5\t37\t6M\t*\t0\t0\tGGGGCC\tFFFFFF\tXA:A:x\tXF:f:1.5\tXI:i:70000\tOQ:Z:IIIIII\n\
r005b\t69\tchr2\t5\t0\t*\t=\t5\t0\tTTTT\t####\n\
r006\t4\t*\t0\t0\t*\t*\t0\t0\tACGTNN\t##!!##\n";

/// Compress `input` with config overrides and return the archive path.
fn compress_files(
    dir: &Path,
    inputs: &[(&str, &str)],
    config_fn: impl FnOnce(&mut CompressConfig),
) -> PathBuf {
    let input: Vec<PathBuf> = inputs
        .iter()
        .map(|(name, data)| {
            let path = dir.join(name);
            fs::write(&path, data).unwrap();
            path
        })
        .collect();
    let archive = dir.join("test.dz");
    let mut compress_args = CompressConfig {
        input,
        output: archive.clone(),
        threads: 1,
        ..CompressConfig::default()
    };
    config_fn(&mut compress_args);
    dz_lib::compression::compress(&compress_args).unwrap();
    assert!(archive.exists());
    archive
}

fn write_reference(dir: &Path) -> PathBuf {
    let path = dir.join("ref.fa");
    fs::write(&path, REFERENCE).unwrap();
    path
}

/// Helper to create default DecompressConfig
fn decompress_args(input: PathBuf, output: PathBuf) -> DecompressConfig {
    DecompressConfig {
        input,
        output,
        threads: 1,
        ..DecompressConfig::default()
    }
}

/// Roundtrip helper: compress SAM_DATA, decompress, return the output text.
fn roundtrip(
    config_fn: impl FnOnce(&mut CompressConfig),
    decompress_fn: impl FnOnce(&mut DecompressConfig),
) -> String {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path();
    let archive = compress_files(dir, &[("input.sam", SAM_DATA)], config_fn);

    let output = dir.join("output.sam");
    let mut args = decompress_args(archive, output.clone());
    decompress_fn(&mut args);
    dz_lib::compression::decompress(&args).unwrap();
    fs::read_to_string(&output).unwrap()
}

/// Like [`roundtrip`], against the test reference on both sides with
/// two-record blocks.
fn reference_roundtrip(decompress_fn: impl FnOnce(&mut DecompressConfig)) -> String {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path();
    let reference = write_reference(dir);
    let archive = compress_files(dir, &[("input.sam", SAM_DATA)], |args| {
        args.reference = Some(reference.clone());
        args.block_size = 2;
    });

    let output = dir.join("output.sam");
    let mut args = decompress_args(archive, output.clone());
    args.reference = Some(reference);
    decompress_fn(&mut args);
    dz_lib::compression::decompress(&args).unwrap();
    fs::read_to_string(&output).unwrap()
}

fn record_lines(text: &str) -> Vec<&str> {
    text.lines().filter(|line| !line.starts_with('@')).collect()
}

fn qnames(text: &str) -> Vec<&str> {
    record_lines(text)
        .iter()
        .map(|line| line.split('\t').next().unwrap())
        .collect()
}

#[test]
fn test_roundtrip_with_reference() {
    assert_eq!(reference_roundtrip(|_| {}), SAM_DATA);
}

#[test]
fn test_roundtrip_without_reference() {
    let output = roundtrip(|_| {}, |_| {});
    assert_eq!(output, SAM_DATA);
}

#[test]
fn test_roundtrip_single_record_blocks() {
    let output = roundtrip(|args| args.block_size = 1, |_| {});
    assert_eq!(output, SAM_DATA);
}

#[test]
fn test_roundtrip_zstd() {
    let output = roundtrip(
        |args| {
            args.backend = StreamBackend::Zstd;
            args.compression_level = 3;
        },
        |_| {},
    );
    assert_eq!(output, SAM_DATA);
}

#[test]
fn test_illumina_binning_only_changes_qualities() {
    let output = roundtrip(|args| args.quality_mode = QualityMode::IlluminaBin, |_| {});
    let original = record_lines(SAM_DATA);
    let decoded = record_lines(&output);
    assert_eq!(original.len(), decoded.len());
    for (o, d) in original.iter().zip(&decoded) {
        let o: Vec<&str> = o.split('\t').collect();
        let d: Vec<&str> = d.split('\t').collect();
        assert_eq!(o.len(), d.len());
        for column in 0..o.len() {
            if column == 10 {
                assert_eq!(o[column].len(), d[column].len());
            } else {
                assert_eq!(o[column], d[column], "column {} differs", column);
            }
        }
    }
}

#[test]
fn test_range_query_with_reference() {
    // range output carries no SAM header, even without no_header
    let output = reference_roundtrip(|args| {
        args.range = Some("chr1:11-14;chr2".to_string());
    });
    let expected: Vec<&str> = record_lines(SAM_DATA)
        .into_iter()
        .filter(|line| {
            ["r003\t", "r003b\t", "r005\t", "r005b\t"]
                .iter()
                .any(|q| line.starts_with(q))
        })
        .collect();
    assert!(!output.starts_with('@'));
    assert_eq!(output.lines().collect::<Vec<_>>(), expected);
}

#[test]
fn test_range_query_open_end() {
    // r004 carries a base that disagrees with the consensus fix at 14
    let output = reference_roundtrip(|args| {
        args.no_header = true;
        args.range = Some("chr1:15".to_string());
    });
    assert_eq!(qnames(&output), vec!["r004"]);
    assert!(output.contains("\tgtacn\t"));
}

#[test]
fn test_range_query_unknown_chromosome() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path();
    let archive = compress_files(dir, &[("input.sam", SAM_DATA)], |_| {});
    let mut args = decompress_args(archive, dir.join("out.sam"));
    args.range = Some("chr9:1-100".to_string());
    let err = dz_lib::compression::decompress(&args).unwrap_err();
    assert!(format!("{:#}", err).contains("invalid chromosome"));
}

#[test]
fn test_flag_filters() {
    let kept = roundtrip(|_| {}, |args| args.filter_flag = 16);
    assert_eq!(qnames(&kept), vec!["r003", "r005"]);

    let dropped = roundtrip(|_| {}, |args| args.filter_flag = -4);
    assert_eq!(qnames(&dropped), vec!["r001", "r002", "r003", "r003b", "r004", "r005"]);
}

#[test]
fn test_multi_sample_archive() {
    let second = "@HD\tVN:1.6\n\
s1\t0\tchrA\t1\t60\t4M\t*\t0\t0\tACGT\tIIII\n\
s2\t4\t*\t0\t0\t*\t*\t0\t0\tGG\t##\n";
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path();
    let archive = compress_files(dir, &[("a.sam", SAM_DATA), ("b.sam", second)], |_| {});

    let output = dir.join("out.sam");
    dz_lib::compression::decompress(&decompress_args(archive.clone(), output.clone())).unwrap();
    assert_eq!(fs::read_to_string(dir.join("out.sam_1")).unwrap(), SAM_DATA);
    assert_eq!(fs::read_to_string(dir.join("out.sam_2")).unwrap(), second);

    let mut args = decompress_args(archive, dir.join("region.sam"));
    args.range = Some("1,chrA".to_string());
    args.no_header = true;
    dz_lib::compression::decompress(&args).unwrap();
    assert_eq!(fs::read_to_string(dir.join("region.sam_1")).unwrap(), "");
    assert_eq!(qnames(&fs::read_to_string(dir.join("region.sam_2")).unwrap()), vec!["s1"]);
}

#[test]
fn test_stats_only_access() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path();
    let archive = compress_files(dir, &[("input.sam", SAM_DATA)], |_| {});
    let stats = dz_lib::compression::read_stats(&archive).unwrap();
    assert_eq!(stats.reads(), 8);
    assert_eq!(stats.mapped(), 6);
    assert_eq!(stats.unmapped(), 2);
    assert_eq!(stats.chromosome_count(), 3);
    assert_eq!(stats.count_matching(16), 2);
}

#[test]
fn test_corrupted_trailer() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path();
    let archive = compress_files(dir, &[("input.sam", SAM_DATA)], |_| {});

    let mut bytes = fs::read(&archive).unwrap();
    let len = bytes.len();
    bytes[len - 8..].copy_from_slice(&u64::MAX.to_le_bytes());
    fs::write(&archive, &bytes).unwrap();

    let err = dz_lib::compression::read_stats(&archive).unwrap_err();
    assert!(format!("{:#}", err).contains("invalid trailer offset"));
    assert!(dz_lib::compression::decompress(&decompress_args(archive, dir.join("out.sam"))).is_err());
}

#[test]
fn test_bad_magic_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bogus.dz");
    fs::write(&path, b"this is not an archive at all").unwrap();
    let err = dz_lib::compression::read_stats(&path).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<dz_lib::DzError>(),
        Some(dz_lib::DzError::Format(_))
    ));
}

#[test]
fn test_debug_streams_written() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path();
    let archive = compress_files(dir, &[("input.sam", SAM_DATA)], |args| args.debug_streams = true);
    for name in ["Sequence", "EditOperation", "ReadName", "QualityScore", "OptionalField"] {
        let mut path = archive.clone().into_os_string();
        path.push(format!(".{name}"));
        assert!(PathBuf::from(path).exists(), "missing {name} stream");
    }
}

#[test]
fn test_unsorted_input_rejected() {
    let unsorted = "r1\t0\tchr1\t10\t60\t4M\t*\t0\t0\tACGT\tIIII\n\
r2\t0\tchr1\t5\t60\t4M\t*\t0\t0\tACGT\tIIII\n";
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path();
    let input = dir.join("unsorted.sam");
    fs::write(&input, unsorted).unwrap();
    let args = CompressConfig {
        input: vec![input],
        output: dir.join("out.dz"),
        threads: 1,
        ..CompressConfig::default()
    };
    let err = dz_lib::compression::compress(&args).unwrap_err();
    assert!(format!("{:#}", err).contains("not sorted"));
}

/// Small deterministic generator so the dense-variant tests are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }

    fn below(&mut self, n: u32) -> u32 {
        self.next() % n
    }
}

/// Reference plus sorted reads of mixed lengths that mostly agree on an
/// alternate base every seventh position, so nearly every block carries fixes
/// that later, longer reads depend on.
fn dense_variant_data(seed: u64, genome_len: usize) -> (String, String) {
    const BASES: &[u8] = b"ACGT";
    let mut rng = Lcg(seed);
    let genome: Vec<u8> = (0..genome_len).map(|_| BASES[rng.below(4) as usize]).collect();

    let mut fasta = String::from(">chr1\n");
    for line in genome.chunks(60) {
        fasta.push_str(std::str::from_utf8(line).unwrap());
        fasta.push('\n');
    }

    let mut sam = format!("@HD\tVN:1.6\tSO:coordinate\n@SQ\tSN:chr1\tLN:{genome_len}\n");
    let mut pos = 1usize;
    let mut i = 0;
    while pos + 80 < genome_len {
        let len = if rng.below(4) == 0 {
            40 + rng.below(40) as usize
        } else {
            5 + rng.below(15) as usize
        };
        let seq: String = (pos - 1..pos - 1 + len)
            .map(|p| {
                let base = genome[p];
                let alt = BASES[(BASES.iter().position(|&b| b == base).unwrap() + 2) % 4];
                if p % 7 == 3 && rng.below(5) != 0 {
                    alt as char
                } else if rng.below(30) == 0 {
                    BASES[rng.below(4) as usize] as char
                } else {
                    base as char
                }
            })
            .collect();
        let qual: String = (0..len).map(|_| (b'!' + rng.below(41) as u8) as char).collect();
        let flag = if rng.below(2) == 0 { 0 } else { 16 };
        sam.push_str(&format!(
            "read{i}\t{flag}\tchr1\t{pos}\t60\t{len}M\t*\t0\t0\t{seq}\t{qual}\n"
        ));
        pos += rng.below(4) as usize;
        i += 1;
    }
    (fasta, sam)
}

#[test]
fn test_range_queries_match_full_decode() {
    for seed in [1u64, 7, 42] {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        let (fasta, sam) = dense_variant_data(seed, 600);
        let reference = dir.join("ref.fa");
        fs::write(&reference, &fasta).unwrap();
        let archive = compress_files(dir, &[("input.sam", sam.as_str())], |args| {
            args.reference = Some(reference.clone());
            args.block_size = 3;
        });

        let full = dir.join("full.sam");
        let mut args = decompress_args(archive.clone(), full.clone());
        args.reference = Some(reference.clone());
        dz_lib::compression::decompress(&args).unwrap();
        let full = fs::read_to_string(&full).unwrap();
        assert_eq!(full, sam, "seed {seed}: full decode differs");

        for start in (1..560).step_by(23) {
            let end = start + 30;
            let output = dir.join(format!("range_{start}.sam"));
            let mut args = decompress_args(archive.clone(), output.clone());
            args.reference = Some(reference.clone());
            args.range = Some(format!("chr1:{start}-{end}"));
            dz_lib::compression::decompress(&args).unwrap();

            let expected: Vec<&str> = record_lines(&full)
                .into_iter()
                .filter(|line| {
                    let pos: usize = line.split('\t').nth(3).unwrap().parse().unwrap();
                    (start..=end).contains(&pos)
                })
                .collect();
            let decoded = fs::read_to_string(&output).unwrap();
            assert_eq!(
                decoded.lines().collect::<Vec<_>>(),
                expected,
                "seed {seed}: region chr1:{start}-{end}"
            );
        }
    }
}
