use rand::Rng;

use bigfile::array::Array;
use bigfile::attrs::Attr;
use bigfile::comm::{Communicator, ThreadComm};
use bigfile::data::BigData;
use bigfile::dtype::Dtype;
use bigfile::error::BigFileError;
use bigfile::file::File;
use bigfile::header::Header;
use bigfile::parallel::{DEFAULT_MEMORY_LIMIT, ParallelFile};

fn random_doubles(n: usize) -> Vec<f64> {
    let mut rng = rand::thread_rng();
    (0..n).map(|_| rng.gen_range(0.0..100000.0)).collect()
}

/// Run `ranks` copies of `body` on threads, one communicator endpoint each.
fn run_ranks(ranks: usize, body: impl Fn(ThreadComm) + Send + Sync + Clone + 'static) {
    let mut handles = Vec::new();
    for comm in ThreadComm::split(ranks) {
        let body = body.clone();
        handles.push(std::thread::spawn(move || body(comm)));
    }
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn write_then_read_back_128_doubles() {
    let dir = tempfile::tempdir().unwrap();
    let f = File::create(dir.path().join("data")).unwrap();
    let data = random_doubles(128);

    let mut b = f
        .create_block("col", &Dtype::parse("<f8").unwrap(), 128, 1)
        .unwrap();
    b.write(0, &Array::from_scalars(&data)).unwrap();
    b.close().unwrap();

    let f = File::open(dir.path().join("data")).unwrap();
    let mut b = f.open_block("col").unwrap();
    assert_eq!(b.read(0, 128).unwrap().to_vec::<f64>().unwrap(), data);
}

#[test]
fn offset_rewrite_is_visible() {
    let dir = tempfile::tempdir().unwrap();
    let f = File::create(dir.path().join("data")).unwrap();
    let data = random_doubles(128);

    let mut b = f
        .create_block("col", &Dtype::parse("<f8").unwrap(), 128, 1)
        .unwrap();
    b.write(0, &Array::from_scalars(&data)).unwrap();
    b.write(1, &Array::from_scalars(&data[0..1])).unwrap();
    b.close().unwrap();

    let mut b = f.open_block("col").unwrap();
    assert_eq!(
        b.read(1, 1).unwrap().to_vec::<f64>().unwrap(),
        vec![data[0]]
    );
}

#[test]
fn oversized_write_fails_and_mutates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let f = File::create(dir.path().join("data")).unwrap();
    let data = random_doubles(128);

    let mut b = f
        .create_block("col", &Dtype::parse("<f8").unwrap(), 128, 1)
        .unwrap();
    b.write(0, &Array::from_scalars(&data)).unwrap();
    assert!(matches!(
        b.write(1, &Array::from_scalars(&data)),
        Err(BigFileError::Bounds { .. })
    ));
    b.close().unwrap();

    let mut b = f.open_block("col").unwrap();
    assert_eq!(b.read(0, 128).unwrap().to_vec::<f64>().unwrap(), data);
}

// Invariant: every supported dtype round-trips byte-exactly at the
// block's declared byte order.
#[test]
fn every_dtype_round_trips() {
    let dtypes = [
        "|b1", "<i4", "<u4", "<u8", "<f4", "<f8", ">i8", ">f4", "<f4(1,)", "<f4(2,)", "<c8",
        "<c16", "<c16(2,)",
    ];
    let dir = tempfile::tempdir().unwrap();
    let f = File::create(dir.path().join("data")).unwrap();
    let mut rng = rand::thread_rng();

    for code in dtypes {
        let dtype = Dtype::parse(code).unwrap();
        let mut bytes = vec![0u8; (dtype.itemsize() * 128) as usize];
        rng.fill(&mut bytes[..]);
        let data = Array::from_bytes(dtype.resolved(), bytes.clone()).unwrap();

        let mut b = f.create_block(code, &dtype, 128, 1).unwrap();
        b.write(0, &data).unwrap();
        b.close().unwrap();

        let mut b = f.open_block(code).unwrap();
        let got = b.read(0, 128).unwrap();
        assert_eq!(got.as_bytes(), &bytes[..], "dtype {code}");
    }

    let listed = f.list_blocks().unwrap();
    assert_eq!(listed.len(), dtypes.len());
}

// Invariant: write(o, x); read(o, k) == x[..k] for any window.
#[test]
fn windows_read_what_was_written() {
    let dir = tempfile::tempdir().unwrap();
    let f = File::create(dir.path().join("data")).unwrap();
    let data = random_doubles(64);

    let mut b = f
        .create_block("col", &Dtype::parse("<f8").unwrap(), 64, 4)
        .unwrap();
    b.write(0, &Array::from_scalars(&data)).unwrap();
    for (offset, count) in [(0u64, 64u64), (1, 5), (15, 17), (31, 33), (63, 1), (64, 0)] {
        let got = b.read(offset, count).unwrap().to_vec::<f64>().unwrap();
        assert_eq!(got, data[offset as usize..(offset + count) as usize]);
    }
}

#[test]
fn attribute_round_trip_and_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let f = File::create(dir.path().join("data")).unwrap();
    {
        let mut b = f.create_attr_block(".").unwrap();
        b.set_attr("int", Attr::int(128)).unwrap();
        b.set_attr("float", Attr::floats(&[128.0, 3.0, 4.0])).unwrap();
        b.set_attr("string", Attr::string("abcdefg")).unwrap();
        b.set_attr("complex", Attr::complex(128.0, 128.0)).unwrap();
        b.set_attr("bool", Attr::boolean(true)).unwrap();
        b.close().unwrap();
    }

    {
        let mut b = f.open_block(".").unwrap();
        assert_eq!(b.get_attr("int").unwrap().as_i64().unwrap(), 128);
        assert_eq!(
            b.get_attr("float").unwrap().as_f64_vec().unwrap(),
            vec![128.0, 3.0, 4.0]
        );
        assert_eq!(b.get_attr("string").unwrap().as_str().unwrap(), "abcdefg");
        assert_eq!(
            b.get_attr("complex").unwrap().as_complex().unwrap(),
            (128.0, 128.0)
        );
        assert!(b.get_attr("bool").unwrap().as_bool().unwrap());

        b.set_attr("int", Attr::int(30)).unwrap();
        b.set_attr("float", Attr::floats(&[3.0, 4.0])).unwrap();
        b.set_attr("string", Attr::string("defg")).unwrap();
        b.set_attr("complex", Attr::complex(32.0, 32.0)).unwrap();
        b.set_attr("bool", Attr::boolean(false)).unwrap();
        b.close().unwrap();
    }

    let b = f.open_block(".").unwrap();
    assert_eq!(b.get_attr("int").unwrap().as_i64().unwrap(), 30);
    assert_eq!(
        b.get_attr("float").unwrap().as_f64_vec().unwrap(),
        vec![3.0, 4.0]
    );
    assert_eq!(b.get_attr("string").unwrap().as_str().unwrap(), "defg");
    assert_eq!(
        b.get_attr("complex").unwrap().as_complex().unwrap(),
        (32.0, 32.0)
    );
    assert!(!b.get_attr("bool").unwrap().as_bool().unwrap());
}

#[test]
fn closed_file_rejects_open_and_refresh() {
    let dir = tempfile::tempdir().unwrap();
    let f = File::create(dir.path().join("data")).unwrap();
    f.create_attr_block(".").unwrap().close().unwrap();
    f.close();
    assert!(matches!(f.open_block("."), Err(BigFileError::Closed)));
    assert!(matches!(f.list_blocks(), Err(BigFileError::Closed)));
}

#[test]
fn bigdata_fields_match_columns() {
    let dir = tempfile::tempdir().unwrap();
    let f = File::create(dir.path().join("data")).unwrap();
    let a = random_doubles(128);
    let b: Vec<f64> = random_doubles(128);

    for (name, data) in [("a", &a), ("b", &b)] {
        let mut blk = f
            .create_block(name, &Dtype::parse("<f8").unwrap(), 128, 2)
            .unwrap();
        blk.write(0, &Array::from_scalars(data)).unwrap();
        blk.close().unwrap();
    }

    let mut bd = BigData::new(&f, None).unwrap();
    assert_eq!(bd.size(), 128);
    let t = bd.slice(0, 128).unwrap();
    assert_eq!(t.field("a").unwrap().to_vec::<f64>().unwrap(), a);
    assert_eq!(t.field("b").unwrap().to_vec::<f64>().unwrap(), b);

    // fields stay aligned through a narrower window
    let t = bd.slice(10, 20).unwrap();
    assert_eq!(t.field("a").unwrap().to_vec::<f64>().unwrap(), a[10..20]);
    assert_eq!(t.field("b").unwrap().to_vec::<f64>().unwrap(), b[10..20]);
}

// ── Collective scenarios ────────────────────────────────────────────

#[test]
fn four_ranks_create_from_array_concatenates_in_rank_order() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("data");
    let global: Vec<f32> = (0..128).map(|i| i as f32).collect();

    let global_for_ranks = global.clone();
    run_ranks(4, move |comm| {
        let shard = &global_for_ranks[comm.rank() * 32..(comm.rank() + 1) * 32];
        let pf = ParallelFile::create(&comm, root.clone()).unwrap();
        let block = pf
            .create_from_array(
                "col",
                &Array::from_scalars(shard),
                Some(1),
                DEFAULT_MEMORY_LIMIT,
            )
            .unwrap();
        assert_eq!(block.size(), 128);
        assert_eq!(block.nfile(), 1);
        block.close().unwrap();
        pf.close().unwrap();
    });

    let f = File::open(dir.path().join("data")).unwrap();
    let mut b = f.open_block("col").unwrap();
    assert_eq!(b.read(0, 128).unwrap().to_vec::<f32>().unwrap(), global);
}

#[test]
fn ranks_write_disjoint_ranges_of_one_block() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("data");

    run_ranks(4, move |comm| {
        let pf = ParallelFile::create(&comm, root.clone()).unwrap();
        let mut block = pf
            .create_block("col", &Dtype::parse("<i4").unwrap(), 64, 2)
            .unwrap();
        let offset = comm.rank() as u64 * 16;
        let shard: Vec<i32> = (offset..offset + 16).map(|i| i as i32).collect();
        block.write(offset, &Array::from_scalars(&shard)).unwrap();
        block.close().unwrap();

        // after the collective close every rank reads everything
        let mut block = pf.open_block("col").unwrap();
        assert_eq!(
            block.read(0, 64).unwrap().to_vec::<i32>().unwrap(),
            (0..64).collect::<Vec<i32>>()
        );
        pf.close().unwrap();
    });
}

#[test]
fn collective_close_combines_checksums() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("data");

    run_ranks(3, move |comm| {
        let pf = ParallelFile::create(&comm, root.clone()).unwrap();
        let mut block = pf
            .create_block("col", &Dtype::parse("|u1").unwrap(), 12, 1)
            .unwrap();
        let offset = comm.rank() as u64 * 4;
        let shard: Vec<u8> = (offset..offset + 4).map(|i| i as u8).collect();
        block.write(offset, &Array::from_scalars(&shard)).unwrap();
        block.close().unwrap();
        pf.close().unwrap();
    });

    let h = Header::load(&dir.path().join("data/col")).unwrap();
    assert_eq!(h.checksums, vec![(0..12u64).sum()]);
}

#[test]
fn collective_refresh_broadcasts_the_block_list() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("data");

    run_ranks(3, move |comm| {
        let pf = ParallelFile::create(&comm, root.clone()).unwrap();
        pf.create_block("a", &Dtype::parse("<f8").unwrap(), 4, 1)
            .unwrap()
            .close()
            .unwrap();
        pf.create_block("nested/b", &Dtype::parse("<f8").unwrap(), 4, 1)
            .unwrap()
            .close()
            .unwrap();
        assert_eq!(pf.blocks(), vec!["a", "nested/b"]);

        let sub = pf.subfile("nested/").unwrap();
        assert_eq!(sub.blocks(), vec!["b"]);
        sub.close().unwrap();
        pf.close().unwrap();
    });
}

#[test]
fn collective_attrs_write_once_read_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("data");

    run_ranks(4, move |comm| {
        let pf = ParallelFile::create(&comm, root.clone()).unwrap();
        let mut block = pf
            .create_block(".", &Dtype::parse("|u1").unwrap(), 0, 0)
            .unwrap();
        block.set_attr("int", Attr::int(128)).unwrap();
        block.set_attr("string", Attr::string("abcdefg")).unwrap();
        assert_eq!(block.get_attr("int").unwrap().as_i64().unwrap(), 128);
        block.close().unwrap();
        pf.close().unwrap();
    });

    let f = File::open(dir.path().join("data")).unwrap();
    let b = f.open_block(".").unwrap();
    assert_eq!(b.get_attr("int").unwrap().as_i64().unwrap(), 128);
    assert_eq!(b.get_attr("string").unwrap().as_str().unwrap(), "abcdefg");
}

#[test]
fn create_from_array_chunks_by_memory_limit() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("data");
    let global: Vec<f64> = (0..8192).map(f64::from).collect();

    let global_for_ranks = global.clone();
    run_ranks(2, move |comm| {
        let half = global_for_ranks.len() / 2;
        let shard = &global_for_ranks[comm.rank() * half..(comm.rank() + 1) * half];
        let pf = ParallelFile::create(&comm, root.clone()).unwrap();
        // a 16 KiB limit makes 2048-record chunks, several passes per rank
        let block = pf
            .create_from_array("col", &Array::from_scalars(shard), None, 16 * 1024)
            .unwrap();
        assert_eq!(block.size(), 8192);
        block.close().unwrap();
        pf.close().unwrap();
    });

    let f = File::open(dir.path().join("data")).unwrap();
    let mut b = f.open_block("col").unwrap();
    assert_eq!(b.read(0, 8192).unwrap().to_vec::<f64>().unwrap(), global);
}
