use briny_graph::prelude::*;

#[test]
fn test_tensor_creation() {
    let t = Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(t.shape, vec![2, 2]);
    assert_eq!(t.data, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(t.dtype(), DType::Float64);
}

#[test]
fn test_tensor_shape_mismatch_panics() {
    let result = std::panic::catch_unwind(|| {
        Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0]);
    });
    assert!(result.is_err());
    assert!(Tensor::try_new(vec![2, 2], vec![1i32, 2, 3]).is_err());
}

#[test]
fn test_tensor_macro() {
    let t = tensor!([[1.0, 2.0], [3.0, 4.0]]);
    assert_eq!(t.shape, vec![2, 2]);
    assert_eq!(t.data, vec![1.0, 2.0, 3.0, 4.0]);

    let cube = tensor!([[[1, 2], [3, 4]], [[5, 6], [7, 8]]]);
    assert_eq!(cube.shape, vec![2, 2, 2]);
    assert_eq!(cube.data[7], 8);
}

#[test]
fn test_session_round_trip_of_host_tensor() {
    let mut s = Session::new();
    let t = tensor!([[1.5f32, 2.5, 3.5], [4.5, 5.5, 6.5]]);
    let n = s.create_tensor(&t).unwrap();
    assert_eq!(s.dtype(n).unwrap(), DType::Float32);
    assert_eq!(s.tensor::<f32>(n).unwrap(), t);
}

#[test]
fn test_scalar_literal_becomes_shape_one() {
    let mut s = Session::new();
    let n = s.create_tensor(&tensor!(4i64)).unwrap();
    assert_eq!(s.shape(n).unwrap(), &[1]);
    assert_eq!(s.read::<i64>(n).unwrap(), vec![4]);
}

#[test]
fn test_type_order() {
    assert!(DType::Int32 < DType::Int64);
    assert!(DType::Int64 < DType::Float32);
    assert!(DType::Float32 < DType::Float64);
    assert_eq!(DType::Int32.unify(DType::Float32), DType::Float32);
    assert_eq!(DType::Float64.unify(DType::Int64), DType::Float64);
}

#[test]
fn test_value_casts() {
    assert_eq!(Value::Float64(2.7).cast(DType::Int32), Value::Int32(2));
    assert_eq!(Value::Int64(-3).cast(DType::Float32), Value::Float32(-3.0));
    assert_eq!(Value::one(DType::Int64), Value::Int64(1));
    assert_eq!(Value::zero(DType::Float32), Value::Float32(0.0));
    assert_eq!(Value::from(2i32).dtype(), DType::Int32);
}

#[test]
fn test_buffer_cast() {
    let b = Buffer::Float64(vec![1.9, -1.9]);
    assert_eq!(*b.cast(DType::Int32), Buffer::Int32(vec![1, -1]));
    assert_eq!(b.cast(DType::Float64).len(), 2);
    let t = Tensor::<i64>::from_buffer(vec![2], &b);
    assert_eq!(t.data, vec![1, -1]);
}

#[test]
fn test_read_converts_element_type() {
    let mut s = Session::new();
    let a = s.create(&[1i32, 2, 3], &[3]).unwrap();
    assert_eq!(s.read::<f64>(a).unwrap(), vec![1.0, 2.0, 3.0]);
    let h = s.create(&[0.5f64, 1.5], &[2]).unwrap();
    assert_eq!(s.read::<i32>(h).unwrap(), vec![0, 1]);
}
