use std::error::Error;

use spmat_core::device::Device;
use spmat_core::perf::poisson_3d;
use spmat_core::{Config, CpuDevice, CsrMatrix, DeviceSet, DistVector, GpuDevice, Matrix, SpMat};

fn human_size(size: u64) -> String {
    let mut size = size as f64;
    let mut unit = "B";
    for u in ["KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            break;
        }
        size /= 1024.0;
        unit = u;
    }
    format!("{:.2} {}", size, unit)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .filter_module("wgpu", log::LevelFilter::Off)
        .filter_module("naga", log::LevelFilter::Off)
        .init();

    // Optional JSON configuration as the first argument.
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_json_file(&path)?,
        None => Config::default(),
    };
    let size = std::env::args()
        .nth(2)
        .map(|s| s.parse::<usize>())
        .transpose()?
        .unwrap_or(32);

    let matrix = poisson_3d::<f32>(size)?;
    log::info!(
        "Poisson problem on a {}^3 grid: {} rows, {} nonzeros",
        size,
        matrix.rows(),
        matrix.nnz()
    );

    if config.use_gpu {
        let devices = GpuDevice::enumerate(&config.gpu).await?;
        log::info!("Found {} GPU adapters", devices.len());
        let set = DeviceSet::new(devices)?.with_partition(config.partition);
        run(set, &matrix, &config).await
    } else {
        let configs = match config.cpu_devices.is_empty() {
            true => vec![Default::default(); 2],
            false => config.cpu_devices.clone(),
        };
        let devices = configs
            .into_iter()
            .map(CpuDevice::new)
            .collect::<Result<Vec<_>, _>>()?;
        let set = DeviceSet::new(devices)?.with_partition(config.partition);
        run(set, &matrix, &config).await
    }
}

async fn run<D: Device>(
    set: DeviceSet<D>,
    matrix: &CsrMatrix<f32>,
    config: &Config,
) -> Result<(), Box<dyn Error>> {
    let set = set.benchmark_weights(8).await?;
    for (device, weight) in set.devices().iter().zip(set.weights()) {
        log::info!("{} ({:?}): weight {:.1}", device.info().name, device.info().class, weight);
    }

    let (rows, cols) = matrix.dims();
    let mut a = SpMat::with_config(
        &set,
        rows,
        cols,
        matrix.row_ptr(),
        matrix.col_indices(),
        matrix.values(),
        config.spmat,
    )?;
    log::info!("Row partition: {:?}", a.row_partition());
    if let Some(layout) = a.exchange_layout() {
        log::info!("{} ghost values exchanged per multiply", layout.len());
    }

    let x_host = vec![1.0f32; cols];
    let x = DistVector::from_slice(&set, &x_host)?;
    let mut y = DistVector::zeros(&set, rows)?;

    let start_time = std::time::Instant::now();
    a.mul(&x, &mut y).await?;
    set.finish()?;
    log::info!("Elapsed time: {:?}", start_time.elapsed());

    let result = y.read().await?;
    let expected = matrix.spmv(&x_host, 1.0)?;
    let max_diff = result
        .iter()
        .zip(&expected)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);
    log::info!("Max difference to the host reference: {}", max_diff);

    for device in set.devices() {
        let ts = device.transfer_stats();
        log::info!(
            "{}: to device {}, from device {}, {} buffers created",
            device.info().name,
            human_size(ts.bytes_to_device),
            human_size(ts.bytes_from_device),
            ts.buffers_created
        );
    }
    Ok(())
}
