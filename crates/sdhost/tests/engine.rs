mod common;

use std::collections::VecDeque;
use std::time::Duration;

use common::{BLOCK, RETRIES, RecordingPlatform, config, host, powered_host, spied};
use sdhost::card::{READ_SINGLE_BLOCK, SELECT_CARD, SEND_STATUS, WRITE_BLOCK};
use sdhost::error::{DeviceFault, TimeoutSite};
use sdhost::response::strip_crc;
use sdhost::{
    BusWidth, Command, ErrorKind, RegisterWindow, ResetScope, Response, ResponseType, SdHost,
    SdhcError, SdhcProtocol, TransferInfo,
};
use sdhost_hw::mmio::sdhost::{Reg, cmd_flags, edm, host_config, status};

fn snapshot(host: &common::TestHost) -> Vec<u32> {
    Reg::ALL.iter().map(|reg| host.window().peek(*reg)).collect()
}

#[test]
fn oversized_transfer_is_rejected_without_register_writes() {
    let mut host = powered_host(8);

    for block_count in [0x1_0000, 0x12_3456, u32::MAX] {
        let transfer = TransferInfo {
            block_count,
            block_size: 512,
        };
        let result = host.send_command(&READ_SINGLE_BLOCK, 0, Some(&transfer));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidParameter);
    }

    assert!(host.window().writes().is_empty());
    assert_eq!(host.platform().stalls, 0);
}

#[test]
fn largest_transfer_is_accepted() {
    let mut host = powered_host(8);
    let transfer = TransferInfo {
        block_count: 0xffff,
        block_size: 512,
    };
    // An idle card answers CMD13 addressed to RCA 0
    let result = host.send_command(&SEND_STATUS, 0, Some(&transfer));
    assert!(result.is_ok());
}

#[test]
fn argument_is_written_before_command() {
    let mut host = powered_host(8);
    host.send_command(&SEND_STATUS, 0, None).unwrap();

    let writes = host.window().writes();
    let arg = writes.iter().position(|w| *w == (Reg::Arg, 0)).unwrap();
    let cmd = writes
        .iter()
        .position(|(reg, value)| *reg == Reg::Cmd && value & cmd_flags::NEW != 0)
        .unwrap();
    assert_eq!(cmd, arg + 1);
    assert_eq!(writes[cmd].1, SEND_STATUS.register_value());

    // Status is cleared before the argument and once the command completed
    assert_eq!(writes[arg - 1], (Reg::Hsts, status::CLEAR_MASK));
    assert_eq!(writes.last(), Some(&(Reg::Hsts, status::CLEAR_MASK)));
}

#[test]
fn stuck_command_times_out_after_exact_budget() {
    let mut host = powered_host(8);
    host.window_mut().hang_next_command();

    let result = host.send_command(&SEND_STATUS, 0, None);
    assert_eq!(
        result.unwrap_err(),
        SdhcError::Timeout(TimeoutSite::Command(SEND_STATUS))
    );
    assert_eq!(host.platform().stalls, RETRIES);
    assert_eq!(host.platform().stalled, Duration::from_micros(20) * RETRIES);

    // The next command finds the controller still busy
    host.platform_mut().forget();
    let result = host.send_command(&SEND_STATUS, 0, None);
    assert_eq!(
        result.unwrap_err(),
        SdhcError::DeviceError(DeviceFault::ControllerBusy)
    );
    assert_eq!(host.platform().stalls, RETRIES);

    // A command reset releases it
    host.software_reset(ResetScope::Cmd).unwrap();
    host.send_command(&SEND_STATUS, 0, None).unwrap();
}

#[test]
fn stuck_fifo_fails_flush_before_issuing() {
    let mut host = powered_host(8);
    host.window_mut().set_fifo_stuck(true);

    let result = host.send_command(&READ_SINGLE_BLOCK, 0, None);
    assert_eq!(result.unwrap_err(), SdhcError::Timeout(TimeoutSite::FifoFlush));
    assert_eq!(host.platform().stalls, RETRIES);
    assert!(
        !host
            .window()
            .writes()
            .iter()
            .any(|(reg, _)| *reg == Reg::Cmd || *reg == Reg::Arg)
    );
}

#[test]
fn stale_fifo_words_are_discarded_before_a_read() {
    let mut host = powered_host(8);
    host.window_mut().fill_fifo([1, 2, 3, 4, 5]);

    // Card is idle and rejects the read, but the flush already ran
    let _ = host.send_command(&READ_SINGLE_BLOCK, 0, None);
    assert_eq!(host.window().fifo_len(), 0);
    assert_eq!(host.platform().stalls, 5);
}

#[test]
fn writes_skip_the_fifo_flush() {
    let mut host = powered_host(8);
    host.window_mut().fill_fifo([1, 2]);
    let _ = host.send_command(&WRITE_BLOCK, 0, None);
    assert_eq!(host.window().fifo_len(), 2);
}

#[test]
fn data_word_timeouts_abort_the_transfer() {
    let mut host = powered_host(8);
    host.window_mut().set_data_never_ready(true);

    let mut buffer = [0xa5u8; 16];
    let result = host.read_block_data(&mut buffer);
    assert_eq!(
        result.unwrap_err(),
        SdhcError::Timeout(TimeoutSite::DataWord {
            index: 0,
            write: false
        })
    );
    assert_eq!(buffer, [0xa5; 16]);
    assert_eq!(host.platform().stalls, RETRIES);
    assert_eq!(host.platform().activity, [true, false]);

    host.platform_mut().forget();
    let result = host.write_block_data(&[0u8; BLOCK]);
    assert_eq!(
        result.unwrap_err(),
        SdhcError::Timeout(TimeoutSite::DataWord {
            index: 0,
            write: true
        })
    );
    assert_eq!(host.platform().stalls, RETRIES);
    assert_eq!(host.platform().activity, [true, false]);
}

#[test]
fn partial_read_leaves_earlier_words_in_place() {
    let mut host = powered_host(8);
    host.window_mut().fill_fifo([0x4433_2211, 0x8877_6655]);

    let mut buffer = [0u8; 12];
    let result = host.read_block_data(&mut buffer);
    assert_eq!(
        result.unwrap_err(),
        SdhcError::Timeout(TimeoutSite::DataWord {
            index: 2,
            write: false
        })
    );
    assert_eq!(buffer, [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0, 0, 0, 0]);
}

#[test]
fn transfer_lengths_are_validated_before_any_access() {
    let mut host = powered_host(8);

    let mut odd = [0u8; 6];
    assert_eq!(
        host.read_block_data(&mut odd).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
    // Reads only need word alignment
    host.window_mut().fill_fifo([0, 0]);
    host.read_block_data(&mut [0u8; 8]).unwrap();

    assert_eq!(
        host.write_block_data(&[0u8; 8]).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
    assert_eq!(host.platform().activity, [true, false]);
}

#[test]
fn deselect_with_rca_zero_succeeds_despite_timeout() {
    let mut host = powered_host(8);
    host.window_mut().fail_next_command(status::CMD_TIMEOUT);
    host.send_command(&SELECT_CARD, 0, None).unwrap();

    host.window_mut().fail_next_command(status::CMD_TIMEOUT);
    let result = host.send_command(&SELECT_CARD, 0x0001_0000, None);
    assert_eq!(
        result.unwrap_err(),
        SdhcError::Timeout(TimeoutSite::Command(SELECT_CARD))
    );
}

#[test]
fn lone_crc7_error_is_ignored() {
    let mut host = powered_host(8);
    host.window_mut().fail_next_command(status::CRC7_ERROR);
    host.send_command(&SEND_STATUS, 0, None).unwrap();

    host.window_mut()
        .fail_next_command(status::CRC7_ERROR | status::CRC16_ERROR);
    let result = host.send_command(&SEND_STATUS, 0, None);
    assert_eq!(
        result.unwrap_err(),
        SdhcError::DeviceError(DeviceFault::CommandFailed {
            command: SEND_STATUS,
            status: status::CRC7_ERROR | status::CRC16_ERROR,
        })
    );
}

#[test]
fn status_is_clean_after_every_failure() {
    let mut host = powered_host(8);
    for bits in [status::CMD_TIMEOUT, status::FIFO_ERROR, status::REW_TIMEOUT] {
        host.window_mut().fail_next_command(bits);
        assert!(host.send_command(&SEND_STATUS, 0, None).is_err());
        assert_eq!(host.window().peek(Reg::Hsts) & status::ERROR_MASK, 0);
    }
}

#[test]
fn negotiation_timeouts_are_flagged_as_expected() {
    let mut host = powered_host(8);
    let send_op_cond = Command::new(1, ResponseType::R3);

    let e = host.send_command(&send_op_cond, 0, None).unwrap_err();
    assert!(e.is_expected_timeout());

    host.window_mut().fail_next_command(status::CMD_TIMEOUT);
    let e = host.send_command(&SEND_STATUS, 0, None).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Timeout);
    assert!(!e.is_expected_timeout());
}

#[test]
fn full_reset_restores_defaults_from_any_state() {
    let mut host = host(8);
    for reg in Reg::ALL {
        host.window_mut().poke(reg, 0xffff_ffff & !cmd_flags::NEW);
    }

    host.software_reset(ResetScope::All).unwrap();

    let sim = host.window();
    assert_eq!(sim.peek(Reg::Vdd), 1);
    assert_eq!(sim.peek(Reg::Cmd), 0);
    assert_eq!(sim.peek(Reg::Arg), 0);
    assert_eq!(sim.peek(Reg::Cdiv), 0);
    assert_eq!(sim.peek(Reg::Hblc), 0);
    assert_eq!(sim.peek(Reg::Hsts) & status::CLEAR_MASK, 0);
    assert_eq!(
        sim.peek(Reg::Hcfg),
        host_config::WIDE_INT_BUS | host_config::SLOW_CARD
    );
    assert_eq!(sim.peek(Reg::Edm), 0xff | edm::THRESHOLDS);
    assert_eq!(sim.peek(Reg::Hbct), 512);

    // Power goes off first and comes back after the registers were zeroed
    let writes = sim.writes();
    assert_eq!(writes.first(), Some(&(Reg::Vdd, 0)));
    let power_on = writes.iter().position(|w| *w == (Reg::Vdd, 1)).unwrap();
    for reg in [Reg::Cmd, Reg::Arg, Reg::Cdiv, Reg::Hcfg, Reg::Hbct, Reg::Hblc] {
        let zeroed = writes.iter().position(|w| *w == (reg, 0)).unwrap();
        assert!(zeroed < power_on, "{} zeroed after power on", reg.name());
    }
    assert_eq!(writes.last(), Some(&(Reg::Hbct, 512)));

    assert_eq!(host.platform().stalls, 2);
    assert_eq!(host.platform().stalled, Duration::from_millis(20));
}

#[test]
fn command_reset_is_idempotent() {
    let mut host = powered_host(8);
    host.window_mut().poke(Reg::Arg, 0x55);
    host.window_mut().poke(Reg::Hsts, status::CRC16_ERROR);

    host.software_reset(ResetScope::Cmd).unwrap();
    let once = snapshot(&host);
    host.software_reset(ResetScope::Cmd).unwrap();
    assert_eq!(snapshot(&host), once);

    assert_eq!(host.window().peek(Reg::Arg), 0);
    assert_eq!(host.window().peek(Reg::Hsts), 0);
    assert_eq!(host.platform().stalls, 0);
}

#[test]
fn data_reset_clears_the_fifo() {
    let mut host = powered_host(8);
    host.window_mut().fill_fifo([1, 2, 3]);

    let before = host.window().peek(Reg::Edm);
    assert_eq!(before, (0x0f & edm::KEEP_MASK) | edm::THRESHOLDS);

    host.software_reset(ResetScope::Data).unwrap();

    assert_eq!(host.window().fifo_len(), 0);
    let (reg, value) = *host.window().writes().last().unwrap();
    assert_eq!(reg, Reg::Edm);
    assert_eq!(value, before | edm::FIFO_CLEAR);
    assert_eq!(host.window().peek(Reg::Edm), before);
}

#[test]
fn unknown_reset_scope_is_invalid() {
    assert_eq!(
        ResetScope::try_from(3).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
}

#[test]
fn clock_divider_for_default_speed() {
    let mut host = powered_host(8);
    host.set_clock(25_000_000).unwrap();

    assert_eq!(host.platform().clock_queries, [4]);
    assert_eq!(
        host.window().writes(),
        &[(Reg::Cdiv, 8), (Reg::Tout, 25_000_000)]
    );
}

#[test]
fn clock_query_failure_touches_no_register() {
    let mut host = SdHost::new(
        spied(vec![0; 8 * BLOCK]),
        RecordingPlatform::failing_clock(),
        config(),
    );

    let e = host.set_clock(400_000).unwrap_err();
    assert_eq!(
        e,
        SdhcError::DeviceError(DeviceFault::ClockUnavailable { clock_id: 4 })
    );
    assert!(host.window().writes().is_empty());

    assert_eq!(host.set_clock(0).unwrap_err().kind(), ErrorKind::InvalidParameter);
    assert!(host.window().writes().is_empty());
}

#[test]
fn clock_target_above_half_u32_is_rejected_before_the_query() {
    let mut host = powered_host(8);

    for target in [3_000_000_000, u32::MAX] {
        let e = host.set_clock(target).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidParameter);
    }
    assert!(host.platform().clock_queries.is_empty());
    assert!(host.window().writes().is_empty());

    // Largest target whose doubled value still fits
    host.set_clock(u32::MAX / 2).unwrap();
    assert_eq!(host.window().writes()[0], (Reg::Cdiv, 0));
}

#[test]
fn bus_width_toggles_the_external_bus_bit() {
    let mut host = powered_host(8);

    host.set_bus_width(BusWidth::Four).unwrap();
    assert_eq!(
        host.window().peek(Reg::Hcfg) & host_config::WIDE_EXT_BUS,
        host_config::WIDE_EXT_BUS
    );
    host.set_bus_width(BusWidth::One).unwrap();
    assert_eq!(host.window().peek(Reg::Hcfg) & host_config::WIDE_EXT_BUS, 0);

    host.window_mut().clear_writes();
    assert_eq!(
        host.set_bus_width(BusWidth::Eight).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
    assert!(host.window().writes().is_empty());
}

#[test]
fn responses_carry_the_documented_word_count() {
    let mut host = powered_host(8);
    let raw = [0x1122_3344, 0x5566_7788, 0x99aa_bbcc, 0xddee_ff00];
    for (reg, word) in Reg::RESPONSE.into_iter().zip(raw) {
        host.window_mut().poke(reg, word);
    }

    for raw_type in 0..10 {
        let response = ResponseType::try_from(raw_type).unwrap();
        let cmd = Command::new(13, response);
        let words = host.receive_response(&cmd).unwrap();
        assert_eq!(words.words().len(), response.word_count());
    }

    let long = host
        .receive_response(&Command::new(9, ResponseType::R2))
        .unwrap();
    let mut raw_bytes: Vec<u8> = raw.iter().flat_map(|w| w.to_le_bytes()).collect();
    raw_bytes.remove(0);
    raw_bytes.push(0);
    let bytes: Vec<u8> = long.words().iter().flat_map(|w| w.to_le_bytes()).collect();
    assert_eq!(bytes, raw_bytes);
    assert_eq!(long, Response::Long(strip_crc(raw)));

    let short = host
        .receive_response(&Command::new(13, ResponseType::R1))
        .unwrap();
    assert_eq!(short, Response::Short(0x1122_3344));

    assert!(ResponseType::try_from(10).is_err());
}

#[test]
fn capabilities_and_stubbed_card_detection() {
    let mut host = powered_host(8);
    let caps = host.capabilities();
    assert_eq!(caps.max_block_size, 512);
    assert_eq!(caps.max_block_count, 0xffff);
    assert!(host.is_card_present());
    assert!(!host.is_read_only());
    host.cleanup();
}

/// FIFO that hands back whatever was written to it
#[derive(Default)]
struct Loopback {
    fifo: VecDeque<u32>,
    cmd: u32,
}

impl RegisterWindow for Loopback {
    fn read32(&mut self, reg: Reg) -> u32 {
        match reg {
            Reg::Hsts => status::DATA_FLAG,
            Reg::Data => self.fifo.pop_front().unwrap_or(0),
            Reg::Cmd => self.cmd,
            _ => 0,
        }
    }

    fn write32(&mut self, reg: Reg, value: u32) {
        match reg {
            Reg::Data => self.fifo.push_back(value),
            Reg::Cmd => self.cmd = value & !cmd_flags::NEW,
            _ => {}
        }
    }
}

#[test]
fn loopback_round_trip() {
    let mut host = SdHost::new(Loopback::default(), RecordingPlatform::default(), config());
    let block: Vec<u8> = (0..BLOCK).map(|i| (i * 7 + 3) as u8).collect();

    host.write_block_data(&block).unwrap();
    assert_eq!(host.window().fifo.len(), BLOCK / 4);

    let mut back = vec![0u8; BLOCK];
    host.read_block_data(&mut back).unwrap();
    assert_eq!(back, block);
    assert_eq!(host.platform().stalls, 0);
    assert_eq!(host.platform().activity, [true, false, true, false]);
}
