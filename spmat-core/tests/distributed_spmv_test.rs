use pollster::block_on;
use spmat_core::device::{Device, DeviceClass};
use spmat_core::kernel_cache::{self, KernelKey};
use spmat_core::kernels::KernelVariant;
use spmat_core::{
    CpuDevice, CpuDeviceConfig, CsrMatrix, DeviceSet, DistVector, PartitionConfig, Real, SpMat,
    SpmvError, StorageFormat, Triplet,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn cpu_set(classes: &[DeviceClass]) -> DeviceSet<CpuDevice> {
    let devices = classes
        .iter()
        .enumerate()
        .map(|(d, &class)| {
            let config = CpuDeviceConfig::default()
                .with_name(&format!("host {}", d))
                .with_class(class)
                .with_compute_units(3);
            CpuDevice::new(config).unwrap()
        })
        .collect();
    DeviceSet::new(devices)
        .unwrap()
        .with_partition(PartitionConfig::with_alignment(1))
}

fn hosts(count: usize) -> DeviceSet<CpuDevice> {
    cpu_set(&vec![DeviceClass::Cpu; count])
}

/// Random matrix with small integer entries, so every summation order is exact.
fn random_matrix<T: Real>(rows: usize, cols: usize, seed: u64) -> CsrMatrix<T> {
    let mut rng = fastrand::Rng::with_seed(seed);
    let mut triplets = Vec::new();
    for i in 0..rows {
        let len = if i % 11 == 0 { 20 } else { rng.usize(0..6) };
        for _ in 0..len {
            let value = T::from(rng.i32(-4..5)).unwrap();
            triplets.push(Triplet::new(i, rng.usize(0..cols), value));
        }
    }
    CsrMatrix::from_triplets(rows, cols, triplets).unwrap()
}

fn random_vector<T: Real>(len: usize, seed: u64) -> Vec<T> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..len).map(|_| T::from(rng.i32(-3..4)).unwrap()).collect()
}

fn banded(n: usize, half_width: usize) -> CsrMatrix<f64> {
    let mut triplets = Vec::new();
    for i in 0..n {
        for j in i.saturating_sub(half_width)..(i + half_width + 1).min(n) {
            let v = if i == j { 2.0 * half_width as f64 } else { -1.0 };
            triplets.push(Triplet::new(i, j, v));
        }
    }
    CsrMatrix::from_triplets(n, n, triplets).unwrap()
}

fn multiply<T: Real>(set: &DeviceSet<CpuDevice>, a: &CsrMatrix<T>, x: &[T]) -> Vec<T> {
    let mut m = SpMat::from_matrix(set, a).unwrap();
    let x = DistVector::from_slice(set, x).unwrap();
    let mut y = DistVector::zeros(set, m.rows()).unwrap();
    block_on(m.mul(&x, &mut y)).unwrap();
    block_on(y.read()).unwrap()
}

fn check_random<T: Real>(devices: usize, seed: u64) {
    let (rows, cols) = (97, 83);
    let a = random_matrix::<T>(rows, cols, seed);
    let x = random_vector::<T>(cols, seed + 100);
    let expected = a.spmv(&x, T::one()).unwrap();
    assert_eq!(multiply(&hosts(devices), &a, &x), expected, "{} devices, seed {}", devices, seed);
}

#[test]
fn test_single_device_is_bit_exact() {
    init_logger();
    let mut rng = fastrand::Rng::with_seed(7);
    let a = random_matrix::<f64>(64, 64, 3);
    let x: Vec<f64> = (0..64).map(|_| rng.f64() - 0.5).collect();
    assert_eq!(multiply(&hosts(1), &a, &x), a.spmv(&x, 1.0).unwrap());
}

#[test]
fn test_multi_device_matches_reference() {
    init_logger();
    for devices in [2, 3, 5] {
        for seed in 0..4 {
            check_random::<f64>(devices, seed);
            check_random::<f32>(devices, seed);
        }
    }
}

#[test]
fn test_banded_matrix_with_default_alignment() {
    init_logger();
    let set = hosts(3).with_partition(PartitionConfig::default());
    let a = banded(200, 3);
    let x = random_vector::<f64>(200, 9);
    let m = SpMat::from_matrix(&set, &a).unwrap();
    assert!(m.row_partition()[1..3].iter().all(|b| b % 16 == 0));
    assert_eq!(multiply(&set, &a, &x), a.spmv(&x, 1.0).unwrap());
}

#[test]
fn test_append_accumulates() {
    init_logger();
    let set = hosts(3);
    let a = random_matrix::<f64>(60, 60, 11);
    let x_host = random_vector::<f64>(60, 12);
    let mut m = SpMat::from_matrix(&set, &a).unwrap();
    let x = DistVector::from_slice(&set, &x_host).unwrap();
    let mut y = DistVector::zeros(&set, 60).unwrap();

    block_on(m.multiply(&x, &mut y, 0.5, false)).unwrap();
    block_on(m.multiply(&x, &mut y, 0.5, true)).unwrap();
    assert_eq!(block_on(y.read()).unwrap(), a.spmv(&x_host, 1.0).unwrap());

    block_on(m.multiply(&x, &mut y, 2.0, false)).unwrap();
    assert_eq!(block_on(y.read()).unwrap(), a.spmv(&x_host, 2.0).unwrap());
}

#[test]
fn test_repeated_multiplies_only_move_ghost_values() {
    init_logger();
    let set = hosts(2);
    let a = banded(6, 1);
    let mut m = SpMat::from_matrix(&set, &a).unwrap();
    let mut x = DistVector::from_slice(&set, &[1.0; 6]).unwrap();
    let mut y = DistVector::zeros(&set, 6).unwrap();

    for round in 0..3 {
        let host: Vec<f64> = (0..6).map(|i| (i * (round + 1)) as f64).collect();
        x.write(&host).unwrap();
        set.finish().unwrap();

        let before: Vec<_> = set.devices().iter().map(|d| d.transfer_stats()).collect();
        block_on(m.mul(&x, &mut y)).unwrap();
        set.finish().unwrap();
        for (device, before) in set.devices().iter().zip(&before) {
            let after = device.transfer_stats();
            // One ghost value each way per device.
            assert_eq!(after.bytes_to_device - before.bytes_to_device, 8);
            assert_eq!(after.bytes_from_device - before.bytes_from_device, 8);
        }
        assert_eq!(block_on(y.read()).unwrap(), a.spmv(&host, 1.0).unwrap());
    }
}

#[test]
fn test_repeated_multiplies_allocate_nothing() {
    init_logger();
    let set = cpu_set(&[DeviceClass::Cpu, DeviceClass::Accelerator, DeviceClass::Cpu]);
    let a = random_matrix::<f64>(90, 90, 71);
    let x_host = random_vector::<f64>(90, 72);
    let mut m = SpMat::from_matrix(&set, &a).unwrap();
    assert!(m.exchange_layout().is_some());
    let x = DistVector::from_slice(&set, &x_host).unwrap();
    let mut y = DistVector::zeros(&set, 90).unwrap();

    // The first call compiles kernels and fills the write staging pools.
    block_on(m.mul(&x, &mut y)).unwrap();
    set.finish().unwrap();
    let created = |set: &DeviceSet<CpuDevice>| -> Vec<u64> {
        set.devices()
            .iter()
            .map(|d| d.transfer_stats().buffers_created)
            .collect()
    };
    let before = created(&set);

    for append in [false, true, false] {
        block_on(m.multiply(&x, &mut y, 1.0, append)).unwrap();
        set.finish().unwrap();
    }
    assert_eq!(created(&set), before);
    assert_eq!(block_on(y.read()).unwrap(), a.spmv(&x_host, 1.0).unwrap());
}

#[test]
fn test_single_device_reads_nothing_back() {
    init_logger();
    let set = hosts(1);
    let a = random_matrix::<f32>(40, 40, 5);
    let mut m = SpMat::from_matrix(&set, &a).unwrap();
    assert!(m.exchange_layout().is_none());
    let x = DistVector::from_slice(&set, &random_vector::<f32>(40, 6)).unwrap();
    let mut y = DistVector::zeros(&set, 40).unwrap();

    let before = set.device(0).transfer_stats();
    block_on(m.mul(&x, &mut y)).unwrap();
    set.finish().unwrap();
    let after = set.device(0).transfer_stats();
    assert_eq!(after.bytes_from_device, before.bytes_from_device);
    assert_eq!(after.bytes_to_device, before.bytes_to_device);
    assert_eq!(after.buffers_created, before.buffers_created);
}

#[test]
fn test_hybrid_format_on_accelerators() {
    init_logger();
    let set = cpu_set(&[DeviceClass::Accelerator; 3]);
    let a = random_matrix::<f64>(90, 90, 21);
    let x = random_vector::<f64>(90, 22);
    let m = SpMat::from_matrix(&set, &a).unwrap();
    for d in 0..3 {
        assert_eq!(m.store_format(d), Some(StorageFormat::Hell));
    }
    assert_eq!(multiply(&set, &a, &x), a.spmv(&x, 1.0).unwrap());
}

#[test]
fn test_mixed_device_classes() {
    init_logger();
    let set = cpu_set(&[DeviceClass::Cpu, DeviceClass::Accelerator, DeviceClass::Gpu]);
    let a = random_matrix::<f32>(75, 75, 31);
    let x = random_vector::<f32>(75, 32);
    let m = SpMat::from_matrix(&set, &a).unwrap();
    assert_eq!(m.store_format(0), Some(StorageFormat::Csr));
    assert_eq!(m.store_format(1), Some(StorageFormat::Hell));
    assert_eq!(m.store_format(2), Some(StorageFormat::Hell));
    assert_eq!(multiply(&set, &a, &x), a.spmv(&x, 1.0).unwrap());
}

#[test]
fn test_weighted_partition() {
    init_logger();
    let set = hosts(2).with_weights(vec![1.0, 3.0]).unwrap();
    let a = random_matrix::<f64>(100, 100, 41);
    let x = random_vector::<f64>(100, 42);
    let m = SpMat::from_matrix(&set, &a).unwrap();
    assert_eq!(m.row_partition(), &[0, 25, 100]);
    assert_eq!(m.col_partition(), &[0, 25, 100]);
    assert_eq!(multiply(&set, &a, &x), a.spmv(&x, 1.0).unwrap());

    assert!(matches!(
        hosts(2).with_weights(vec![1.0]),
        Err(SpmvError::InvalidWeights(_))
    ));
    assert!(matches!(
        hosts(2).with_weights(vec![1.0, f64::NAN]),
        Err(SpmvError::InvalidWeights(_))
    ));
}

#[test]
fn test_kernels_are_built_per_context_and_type() {
    init_logger();
    let set = hosts(2);
    let context = set.device(0).info().context;
    let csr_f32 = KernelKey::new::<f32>(context, KernelVariant::CsrSet);
    let csr_f64 = KernelKey::new::<f64>(context, KernelVariant::CsrSet);
    let hell_f32 = KernelKey::new::<f32>(context, KernelVariant::HellSet);
    assert!(!kernel_cache::contains(&csr_f32));

    let a = random_matrix::<f32>(30, 30, 51);
    let x = random_vector::<f32>(30, 52);
    multiply(&set, &a, &x);
    assert!(kernel_cache::contains(&csr_f32));
    assert!(!kernel_cache::contains(&csr_f64));
    assert!(!kernel_cache::contains(&hell_f32));

    // A sibling shares the context, so it finds the kernels already built.
    let sibling = set.device(0).sibling().unwrap();
    assert_eq!(sibling.info().context, context);
    let entry = sibling.kernel::<f32>(KernelVariant::CsrSet).unwrap();
    let again = set.device(0).kernel::<f32>(KernelVariant::CsrSet).unwrap();
    assert!(std::sync::Arc::ptr_eq(&entry, &again));
}

#[test]
fn test_empty_matrix_and_vectors() {
    init_logger();
    let set = hosts(3);
    let a = CsrMatrix::<f64>::new(0, 0);
    let mut m = SpMat::from_matrix(&set, &a).unwrap();
    let x = DistVector::zeros(&set, 0).unwrap();
    let mut y = DistVector::zeros(&set, 0).unwrap();
    block_on(m.mul(&x, &mut y)).unwrap();
    assert!(block_on(y.read()).unwrap().is_empty());
}

#[test]
fn test_rows_without_entries_are_zeroed() {
    init_logger();
    let set = hosts(2);
    let a = CsrMatrix::from_triplets(4, 4, vec![Triplet::new(0, 3, 2.0f64)]).unwrap();
    let mut m = SpMat::from_matrix(&set, &a).unwrap();
    let x = DistVector::from_slice(&set, &[1.0, 1.0, 1.0, 5.0]).unwrap();
    let mut y = DistVector::from_slice(&set, &[9.0; 4]).unwrap();
    block_on(m.mul(&x, &mut y)).unwrap();
    assert_eq!(block_on(y.read()).unwrap(), vec![10.0, 0.0, 0.0, 0.0]);
}

#[test]
#[ignore = "requires a GPU adapter"]
fn test_gpu_matches_reference() -> Result<(), SpmvError> {
    init_logger();
    block_on(async {
        let gpu = spmat_core::GpuDevice::new().await?;
        let set = DeviceSet::new(vec![gpu])?;
        let a = random_matrix::<f32>(500, 500, 61);
        let x_host = random_vector::<f32>(500, 62);
        let mut m = SpMat::from_matrix(&set, &a)?;
        let x = DistVector::from_slice(&set, &x_host)?;
        let mut y = DistVector::zeros(&set, 500)?;
        m.mul(&x, &mut y).await?;
        assert_eq!(y.read().await?, a.spmv(&x_host, 1.0)?);
        Ok(())
    })
}
