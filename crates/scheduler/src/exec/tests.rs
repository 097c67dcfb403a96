use std::sync::Arc;
use std::time::Duration;

use kds_core::{
    encode_exec_write, encode_start_cu, ConfigFeatures, ConfigurePacket, DispatchMode,
    InitCuPacket, Opcode, PacketView, SchedulerConfig, REGMAP_CU_INDEX,
};

use super::*;
use crate::buffer::HostBuffer;
use crate::command::Command;
use crate::cu::regs::hls::ctrl;
use crate::io::MemRegisters;
use crate::layout::{CuLayout, UniformLayout};

const BASE: u64 = 0x80_0000;
const SHIFT: u32 = 16;

fn config(queue_space: u32) -> SchedulerConfig {
    SchedulerConfig {
        queue_space,
        ..Default::default()
    }
}

fn core_with(cfg: &SchedulerConfig, layout: Arc<dyn BitstreamLayout>) -> (Arc<MemRegisters>, ExecCore) {
    let regs = Arc::new(MemRegisters::new());
    let io: Arc<dyn RegisterIo> = regs.clone();
    (regs, ExecCore::new(cfg, io, layout))
}

/// Two HLS CUs at 0x800000 / 0x810000 with 16 slots.
fn two_cu_core() -> (Arc<MemRegisters>, ExecCore) {
    let (regs, mut core) = core_with(&config(4096), Arc::new(CuLayout::strided(BASE, SHIFT, 2, 0)));
    core.configure(&ConfigureRequest::new(256, 2, SHIFT, BASE), 0).unwrap();
    (regs, core)
}

fn command(index: u32, opcode: Opcode, words: Vec<u32>) -> Command {
    let mask = BitSet::from_words(PacketView::parse(&words).unwrap().cu_masks());
    let mut cmd = Command::new(index);
    cmd.load(Box::new(HostBuffer::new(words)), opcode, mask, None);
    cmd
}

fn start(index: u32, mask: u32) -> Command {
    command(index, Opcode::StartCu, encode_start_cu(&[mask], &[0, 0, 0, 0, 0xA0 + index]))
}

fn finish_cu(regs: &MemRegisters, idx: u64) {
    regs.poke(BASE + (idx << SHIFT), ctrl::AP_DONE | ctrl::AP_IDLE);
}

#[test]
fn test_configure_derives_geometry() {
    let (_, core) = two_cu_core();
    assert!(core.is_configured());
    assert_eq!(core.num_slots(), 16);
    assert_eq!(core.num_cus(), 2);
    assert_eq!(core.num_cu_masks(), 1);
    assert_eq!(core.slot_size(), 256);
    assert_eq!(core.cu_shift(), SHIFT);
    assert_eq!(core.cu_base_addr(), BASE);
    assert_eq!(core.cu(0).unwrap().base_addr(), 0x80_0000);
    assert_eq!(core.cu(1).unwrap().base_addr(), 0x81_0000);
}

#[test]
fn test_configure_twice_rejected() {
    let (_, mut core) = two_cu_core();
    assert!(matches!(
        core.configure(&ConfigureRequest::new(256, 2, SHIFT, BASE), 0),
        Err(SchedError::ConfigAlreadyDone)
    ));
}

#[test]
fn test_configure_busy_leaves_state_untouched() {
    let (_, mut core) = core_with(&config(4096), Arc::new(UniformLayout(CuModel::Hls)));
    let err = core
        .configure(&ConfigureRequest::new(256, 2, SHIFT, BASE), 3)
        .unwrap_err();
    assert!(matches!(err, SchedError::ConfigRejectedBusy { outstanding: 3 }));
    assert!(!core.is_configured());
    assert_eq!(core.num_slots(), 16);
    assert_eq!(core.num_cus(), 0);
    assert!(core.cu(0).is_none());
}

#[test]
fn test_reconfigure_while_running_reports_busy() {
    let (_, mut core) = two_cu_core();
    let mut cmd = start(0, 0b01);
    assert!(core.submit(&mut cmd, 0).unwrap());

    let err = core
        .configure(&ConfigureRequest::new(256, 2, SHIFT, BASE), 1)
        .unwrap_err();
    assert!(matches!(err, SchedError::ConfigRejectedBusy { outstanding: 1 }));
    assert!(core.is_configured());
    assert_eq!(core.slots_in_use(), 1);
}

#[test]
fn test_cu_stride_outside_address_space_rejected() {
    let (_, mut core) = core_with(&config(4096), Arc::new(UniformLayout(CuModel::Hls)));
    let err = core
        .configure(&ConfigureRequest::new(256, 2, 64, BASE), 0)
        .unwrap_err();
    assert!(matches!(err, SchedError::InvalidConfig(_)), "{err}");

    // 2 << 63 does not fit in 64 bits.
    let err = core
        .configure(&ConfigureRequest::new(256, 3, 63, BASE), 0)
        .unwrap_err();
    assert!(err.to_string().contains("overflows"), "{err}");
    assert!(!core.is_configured());
    assert_eq!(core.num_cus(), 0);
}

#[test]
fn test_embedded_mode_unsupported() {
    let cfg = SchedulerConfig {
        mode: DispatchMode::Embedded,
        ..config(4096)
    };
    let (_, mut core) = core_with(&cfg, Arc::new(UniformLayout(CuModel::Hls)));
    assert!(matches!(
        core.configure(&ConfigureRequest::new(256, 1, SHIFT, BASE), 0),
        Err(SchedError::Unsupported(_))
    ));
}

#[test]
fn test_unknown_cu_address_rejected() {
    let (_, mut core) = core_with(&config(4096), Arc::new(CuLayout::strided(BASE, SHIFT, 1, 0)));
    let err = core
        .configure(&ConfigureRequest::new(256, 2, SHIFT, BASE), 0)
        .unwrap_err();
    assert!(err.to_string().contains("0x810000"), "{err}");
    assert!(!core.is_configured());
}

#[test]
fn test_slot_count_bounds() {
    let (_, mut core) = core_with(&config(4096), Arc::new(UniformLayout(CuModel::Hls)));
    assert!(matches!(
        core.configure(&ConfigureRequest::new(0, 1, SHIFT, BASE), 0),
        Err(SchedError::InvalidConfig(_))
    ));
    assert!(matches!(
        core.configure(&ConfigureRequest::new(8192, 1, SHIFT, BASE), 0),
        Err(SchedError::InvalidConfig(_))
    ));
    assert!(matches!(
        core.configure(&ConfigureRequest::new(16, 1, SHIFT, BASE), 0),
        Err(SchedError::InvalidConfig(_))
    ));
}

#[test]
fn test_explicit_addresses_strip_handshake_bits() {
    let (_, mut core) = core_with(&config(4096), Arc::new(CuLayout::strided(0x1000, 12, 2, 0)));
    let req = ConfigureRequest::new(256, 2, 0, 0).with_cu_addrs(vec![0x1005, 0x2001]);
    core.configure(&req, 0).unwrap();
    assert_eq!(core.cu(0).unwrap().base_addr(), 0x1000);
    assert_eq!(core.cu(1).unwrap().base_addr(), 0x2000);
}

#[test]
fn test_acc_forces_polling() {
    let (_, mut core) = core_with(&config(4096), Arc::new(CuLayout::strided(BASE, SHIFT, 1, 1)));
    core.configure(&ConfigureRequest::new(256, 2, SHIFT, BASE).with_polling(false), 0)
        .unwrap();
    assert!(core.polling());
    assert_eq!(core.cu(1).unwrap().max_credits(), 16);
}

#[test]
fn test_many_cus_force_polling() {
    let (_, mut core) = core_with(&config(4096), Arc::new(UniformLayout(CuModel::Hls)));
    core.configure(&ConfigureRequest::new(256, 40, 12, 0).with_polling(false), 0)
        .unwrap();
    assert!(core.polling());
    assert_eq!(core.num_cu_masks(), 2);
}

#[test]
fn test_interrupt_mode_enables_cu_interrupts() {
    let (regs, mut core) = core_with(&config(4096), Arc::new(UniformLayout(CuModel::Hls)));
    core.configure(&ConfigureRequest::new(256, 2, SHIFT, BASE).with_polling(false), 0)
        .unwrap();
    assert!(!core.polling());
    assert_eq!(regs.read32(BASE + 0x08), 1);
    assert_eq!(regs.read32(BASE + (1 << SHIFT) + 0x04), 1);
}

#[test]
fn test_reset_disables_cu_interrupts() {
    let (regs, mut core) = core_with(&config(4096), Arc::new(UniformLayout(CuModel::Hls)));
    core.configure(&ConfigureRequest::new(256, 2, SHIFT, BASE).with_polling(false), 0)
        .unwrap();
    core.reset(0).unwrap();
    for base in [BASE, BASE + (1 << SHIFT)] {
        assert_eq!(regs.read32(base + 0x08), 0);
        assert_eq!(regs.read32(base + 0x04), 0);
    }
    assert!(core.polling());
}

#[test]
fn test_first_fit_cu_selection() {
    let (_, mut core) = two_cu_core();
    let mask = BitSet::from_words(&[0b11]);
    assert_eq!(core.acquire_cu(&mask), Some(0));
    assert_eq!(core.acquire_cu(&mask), Some(1));
    assert_eq!(core.acquire_cu(&mask), None);
    assert_eq!(core.cu_busy().count_ones(), 2);

    core.release_cu(0);
    assert_eq!(core.acquire_cu(&mask), Some(0));
}

#[test]
fn test_start_dispatches_and_writes_regmap() {
    let (regs, mut core) = two_cu_core();
    let mut cmd = start(0, 0b10);
    assert!(core.submit(&mut cmd, 0).unwrap());
    assert_eq!(cmd.cu_idx, Some(1));
    assert_eq!(cmd.slot_idx, Some(0));
    assert_eq!(cmd.regmap()[REGMAP_CU_INDEX], 1);

    let cu1 = BASE + (1 << SHIFT);
    let writes = regs.writes();
    assert!(writes.contains(&(cu1 + 0x10, 0xA0)));
    assert_eq!(writes.last(), Some(&(cu1, ctrl::AP_START)));
}

#[test]
fn test_three_commands_on_two_cus() {
    let (_, mut core) = two_cu_core();
    let mut c1 = start(0, 0b11);
    let mut c2 = start(1, 0b11);
    let mut c3 = start(2, 0b11);
    assert!(core.submit(&mut c1, 0).unwrap());
    assert!(core.submit(&mut c2, 0).unwrap());
    assert!(!core.submit(&mut c3, 0).unwrap());
    assert_eq!(c1.cu_idx, Some(0));
    assert_eq!(c2.cu_idx, Some(1));
    assert_eq!(c3.cu_idx, None);
    assert_eq!(core.slots_in_use(), 2);
}

#[test]
fn test_query_completes_and_returns_resources() {
    let (regs, mut core) = two_cu_core();
    let mut cmd = start(0, 0b1);
    core.submit(&mut cmd, 0).unwrap();
    assert!(!core.query(&mut cmd));

    finish_cu(&regs, 0);
    assert!(core.query(&mut cmd));
    assert_eq!(core.slots_in_use(), 0);
    assert!(core.cu_busy().is_empty());
    assert_eq!(core.cu(0).unwrap().credits(), 1);
    assert_eq!(regs.read32(BASE), ctrl::AP_CONTINUE);
}

#[test]
fn test_only_fifo_head_is_retired() {
    let (regs, mut core) = core_with(&config(4096), Arc::new(CuLayout::strided(BASE, SHIFT, 0, 1)));
    core.configure(&ConfigureRequest::new(256, 1, SHIFT, BASE), 0).unwrap();
    let mut first = start(0, 1);
    let mut second = start(1, 1);
    core.submit(&mut first, 0).unwrap();
    core.submit(&mut second, 0).unwrap();

    regs.poke(BASE + 0x04, 1);
    assert!(!core.query(&mut second));
    assert!(core.query(&mut first));
    regs.poke(BASE + 0x04, 0);
    assert!(!core.query(&mut second));
}

#[test]
fn test_slot_exhaustion_keeps_command_queued() {
    let (_, mut core) = core_with(&config(512), Arc::new(UniformLayout(CuModel::Acc)));
    core.configure(&ConfigureRequest::new(256, 1, SHIFT, BASE), 0).unwrap();
    let mut a = start(0, 1);
    let mut b = start(1, 1);
    let mut c = start(2, 1);
    assert!(core.submit(&mut a, 0).unwrap());
    assert!(core.submit(&mut b, 0).unwrap());
    assert!(!core.submit(&mut c, 0).unwrap());
    assert_eq!(core.cu(0).unwrap().credits(), 14);
}

#[test]
fn test_exec_write_uses_pairs() {
    let (regs, mut core) = two_cu_core();
    let words = encode_exec_write(&[1], &[(0x40, 5), (0x1C, 6)]);
    let mut cmd = command(0, Opcode::ExecWrite, words);
    assert!(core.submit(&mut cmd, 0).unwrap());
    let writes = regs.writes();
    assert!(writes.contains(&(BASE + 0x40, 5)));
    assert!(writes.contains(&(BASE + 0x1C, 6)));
}

#[test]
fn test_start_requires_configuration_and_valid_mask() {
    let (_, mut core) = core_with(&config(4096), Arc::new(UniformLayout(CuModel::Hls)));
    let mut cmd = start(0, 1);
    assert!(matches!(core.submit(&mut cmd, 0), Err(SchedError::NotConfigured)));

    let (_, mut core) = two_cu_core();
    let mut cmd = start(0, 0b100);
    assert!(matches!(core.submit(&mut cmd, 0), Err(SchedError::InvalidCuMask)));
}

#[test]
fn test_unknown_opcode_is_reported() {
    let (_, mut core) = two_cu_core();
    let mut words = encode_start_cu(&[1], &[0; 4]);
    words[0] = (words[0] & !(0x1F << 23)) | (9 << 23);
    let mut cmd = command(0, Opcode::from_raw(9), words);
    assert!(matches!(core.submit(&mut cmd, 0), Err(SchedError::UnknownOpcode(9))));
}

#[test]
fn test_configure_command_takes_transient_slot() {
    let (_, mut core) = core_with(&config(4096), Arc::new(UniformLayout(CuModel::Hls)));
    let packet = ConfigurePacket {
        slot_size: 1024,
        num_cus: 1,
        cu_shift: SHIFT,
        cu_base_addr: BASE as u32,
        features: ConfigFeatures {
            ert: true,
            polling: true,
        },
        cu_addrs: Vec::new(),
    };
    let mut cmd = command(0, Opcode::Configure, packet.encode());
    assert!(core.submit(&mut cmd, 0).unwrap());
    assert_eq!(core.num_slots(), 4);
    assert_eq!(core.slots_in_use(), 1);
    assert!(core.query(&mut cmd));
    assert_eq!(core.slots_in_use(), 0);
}

#[test]
fn test_init_cu_runs_once_per_cu() {
    let (regs, mut core) = two_cu_core();
    let packet = InitCuPacket {
        run_timeout_us: 500,
        reset_timeout_us: 0,
        cu_masks: vec![0b111],
        regmap: vec![0, 0, 0, 0, 0x77],
    };
    let mut first = command(0, Opcode::InitCu, packet.encode());
    assert!(core.submit(&mut first, 0).unwrap());
    assert!(regs.writes().contains(&(BASE + 0x10, 0x77)));
    assert_eq!(core.cu(1).unwrap().run_timeout(), Some(Duration::from_micros(500)));
    assert!(core.query(&mut first));

    regs.clear_log();
    let mut second = command(1, Opcode::InitCu, packet.encode());
    assert!(core.submit(&mut second, 0).unwrap());
    assert!(regs.writes().is_empty());
    assert!(core.cu_usage().iter().all(|u| u.initialized));
}

#[test]
fn test_overrun_flagged_once() {
    let (_, mut core) = two_cu_core();
    core.cus[0].set_timeouts(Some(Duration::from_nanos(1)), None);
    let mut cmd = start(0, 1);
    core.submit(&mut cmd, 0).unwrap();
    std::thread::sleep(Duration::from_millis(2));
    assert!(core.check_overrun(&mut cmd));
    assert!(!core.check_overrun(&mut cmd));
    assert!(cmd.handle().snapshot().overdue);
}

#[test]
fn test_reset_cu_abandons_running_commands() {
    let (regs, mut core) = core_with(&config(4096), Arc::new(UniformLayout(CuModel::Acc)));
    core.configure(&ConfigureRequest::new(256, 1, SHIFT, BASE), 0).unwrap();
    let mut a = start(4, 1);
    let mut b = start(5, 1);
    core.submit(&mut a, 0).unwrap();
    core.submit(&mut b, 0).unwrap();
    regs.poke(BASE + 0x04, crate::cu::regs::acc::status::RESET_DONE);

    let (abandoned, result) = core.reset_cu(0, Duration::from_millis(50));
    assert!(result.is_ok());
    assert_eq!(abandoned, vec![4, 5]);
    assert!(core.cu_busy().is_empty());
    assert_eq!(core.cu(0).unwrap().credits(), 16);
}

#[test]
fn test_reset_cu_timeout_is_hardware_fault() {
    let (_, mut core) = two_cu_core();
    let (_, result) = core.reset_cu(1, Duration::from_millis(5));
    assert!(matches!(result, Err(SchedError::HardwareFault { cu: 1, .. })));
    assert!(!core.has_eligible(&BitSet::from_words(&[0b10])));
    assert!(core.has_eligible(&BitSet::from_words(&[0b11])));
}

#[test]
fn test_reset_requires_idle() {
    let (_, mut core) = two_cu_core();
    assert!(matches!(core.reset(1), Err(SchedError::ConfigRejectedBusy { .. })));
    core.reset(0).unwrap();
    assert!(!core.is_configured());
    assert!(core.configure(&ConfigureRequest::new(512, 1, SHIFT, BASE), 0).is_ok());
    assert_eq!(core.num_slots(), 8);
}
