//! Queue-pair submit/drain throughput, in the spirit of the small-message
//! vs. large-message IPC scenarios the kernel's own benches measure, but
//! for I/O commands against the in-process simulator instead of hardware.

use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use unvme::clock::SystemClock;
use unvme::config::UnvmeConfig;
use unvme::driver::{ControllerDriver, DmaProvider};
use unvme::pci::PciAddress;
use unvme::sim::{SimControllerDriver, SimDmaProvider};

fn open_session(qsize: u32) -> unvme::NsHandle {
    let pci = PciAddress::parse("01:00.0").unwrap();
    let driver: std::sync::Arc<dyn ControllerDriver> =
        std::sync::Arc::new(SimControllerDriver::new(512, 4096, 1 << 24));
    let dma: std::sync::Arc<dyn DmaProvider> = std::sync::Arc::new(SimDmaProvider::new(256 << 20));
    let config = UnvmeConfig { back_pressure_timeout: Duration::from_secs(5), ..Default::default() };
    unvme::open(&pci, 1, 1, qsize, driver, dma, &config).unwrap()
}

fn single_page_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_page_write");
    for qsize in [8u32, 64, 256] {
        let ns = open_session(qsize);
        let buf = unvme::alloc(&ns, 4096).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(qsize), &qsize, |b, _| {
            b.iter(|| {
                let iod = unvme::awrite(&ns, 0, buf, 0, 1).unwrap();
                loop {
                    match unvme::apoll(&ns, iod, Duration::ZERO).unwrap() {
                        unvme::PollOutcome::Pending => std::hint::spin_loop(),
                        _ => break,
                    }
                }
            });
        });
        unvme::free(&ns, buf).unwrap();
        unvme::close(ns).unwrap();
    }
    group.finish();
}

fn split_large_writes(c: &mut Criterion) {
    let ns = open_session(64);
    let maxbpio = unvme::namespace(&ns).maxbpio;
    let nlb = maxbpio * 4;
    let buf = unvme::alloc(&ns, nlb as usize * 512).unwrap();

    c.bench_function("split_write_4x_maxbpio", |b| {
        b.iter(|| {
            unvme::write(&ns, 0, buf, 0, nlb).unwrap();
        });
    });

    unvme::free(&ns, buf).unwrap();
    unvme::close(ns).unwrap();
}

fn prp_construction(c: &mut Criterion) {
    // Isolates `QueuePair::build_prp`'s cost for a multi-page command from
    // the simulator's own execute() work, unlike the end-to-end benches
    // above.
    use unvme::descriptor::Opcode;
    use unvme::namespace::Namespace;
    use unvme::queue::QueuePair;

    let ns = Namespace {
        nsid: 1,
        vendor_id: 1,
        serial: "b".into(),
        model: "b".into(),
        firmware: "b".into(),
        block_count: 1 << 24,
        page_size: 4096,
        page_shift: 12,
        block_size: 512,
        block_shift: 9,
        nbpp: 8,
        maxppio: 16,
        maxbpio: 128,
        qcount: 1,
        qsize: 64,
        maxiopq: 63,
        dev_max_qsize: 4096,
        dev_max_qcount: 64,
    };

    let dma = SimDmaProvider::new(256 << 20);
    let sim = SimControllerDriver::new(ns.block_size, ns.page_size, ns.block_count);
    let ctrl = sim.open(&PciAddress::parse("02:00.0").unwrap()).unwrap();
    let mut qp = QueuePair::new(0, ns.qsize as u16, ns.page_size, &dma).unwrap();
    let buf = dma.alloc(16 * ns.page_size as usize).unwrap();

    c.bench_function("build_prp_sixteen_pages", |b| {
        b.iter(|| {
            let desc = qp.descriptors.get().unwrap();
            qp.submit_one(
                &ns,
                desc,
                &sim,
                ctrl,
                &SystemClock,
                Duration::from_secs(1),
                ns.nsid,
                Opcode::Write,
                0,
                ns.maxbpio,
                buf,
                buf.phys,
            )
            .unwrap();
            qp.complete_one(&sim, ctrl, &SystemClock, Duration::from_secs(1)).unwrap();
            qp.descriptors.put(desc);
        });
    });
}

criterion_group!(benches, single_page_writes, split_large_writes, prp_construction);
criterion_main!(benches);
