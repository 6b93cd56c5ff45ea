use briny_graph::modelio::{MAGIC, deserialize, load_nodes, save_nodes, serialize};
use briny_graph::prelude::*;
use rand::Rng;

#[test]
fn test_round_trip_every_type() {
    let mut s = Session::new();
    let nodes = [
        s.create(&[1i32, -2, 3, -4, 5, -6], &[2, 3]).unwrap(),
        s.create(&[i64::MAX, i64::MIN], &[2, 1]).unwrap(),
        s.create(&[0.25f32, -1.5], &[2]).unwrap(),
        s.create(&[f64::MAX, f64::MIN_POSITIVE, -0.0], &[1, 3, 1]).unwrap(),
    ];
    for n in nodes {
        let bytes = serialize(&mut s, n).unwrap();
        let back = deserialize(&mut s, &bytes).unwrap();
        assert_eq!(s.shape(back).unwrap(), s.shape(n).unwrap());
        assert_eq!(s.dtype(back).unwrap(), s.dtype(n).unwrap());
        assert_eq!(s.op_kind(back).unwrap(), OpKind::Store);
        assert_eq!(serialize(&mut s, back).unwrap(), bytes);
    }
}

#[test]
fn test_round_trip_of_computed_node() {
    let mut rng = rand::rng();
    let data: Vec<f64> = (0..24).map(|_| rng.random_range(-10.0..10.0)).collect();
    let mut s = Session::new();
    let a = s.create(&data, &[2, 3, 4]).unwrap();
    let b = s.transpose(a, &[2, 0, 1]).unwrap();
    let c = s.mul_scalar(b, 3.0).unwrap();
    let bytes = serialize(&mut s, c).unwrap();
    let back = deserialize(&mut s, &bytes).unwrap();
    assert_eq!(s.shape(back).unwrap(), &[4, 2, 3]);
    assert_eq!(s.read::<f64>(back).unwrap(), s.read::<f64>(c).unwrap());
}

#[test]
fn test_bad_magic_is_rejected() {
    let mut s = Session::new();
    let a = s.create(&[1.0f32], &[1]).unwrap();
    let mut bytes = serialize(&mut s, a).unwrap();
    assert_eq!(&bytes[..4], &MAGIC.to_be_bytes());
    bytes[3] ^= 0xff;
    let before = s.live_nodes();
    assert_eq!(deserialize(&mut s, &bytes), None);
    assert_eq!(deserialize(&mut s, &[]), None);
    assert_eq!(s.live_nodes(), before);
}

#[test]
fn test_save_and_load_nodes() {
    let mut s = Session::new();
    let a = s.create(&[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    let b = s.arange(&[1, 4], 1).unwrap();
    let path = std::env::temp_dir().join(format!("briny_graph_nodes_{}.bin", std::process::id()));
    let path = path.to_str().unwrap();
    save_nodes(&mut s, path, &[a, b]).unwrap();

    let mut fresh = Session::new();
    let loaded = load_nodes(&mut fresh, path).unwrap();
    std::fs::remove_file(path).unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(fresh.shape(loaded[0]).unwrap(), &[2, 3]);
    assert_eq!(fresh.read::<f64>(loaded[0]).unwrap(), s.read::<f64>(a).unwrap());
    assert_eq!(fresh.dtype(loaded[1]).unwrap(), DType::Int64);
    assert_eq!(fresh.read::<i64>(loaded[1]).unwrap(), vec![0, 1, 2, 3]);
}
