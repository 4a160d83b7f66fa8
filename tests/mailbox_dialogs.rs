//! Mailbox dialogs through the public API, with the response-side mailbox standing in for a
//! real device.

use catenary::error::MailboxError;
use catenary::mailbox::request::{Mailbox, MessageStatus};
use catenary::mailbox::response::{MemoryFileStore, ResponseMailbox, SimpleDictionary};
use catenary::mailbox::MailboxConfig;
use core::time::Duration;

const TIMEOUT: Duration = Duration::from_millis(100);

fn config() -> MailboxConfig {
    MailboxConfig {
        recv_offset: 0x1000,
        recv_size: 128,
        send_offset: 0x1080,
        send_size: 128,
    }
}

fn pump(mailbox: &mut Mailbox, device: &mut ResponseMailbox) {
    let mut now = Duration::ZERO;

    for _ in 0..64 {
        if !mailbox.is_busy() {
            break;
        }

        now += Duration::from_millis(1);

        let Some(frame) = mailbox.send(now) else {
            break;
        };

        device.receive(&frame);

        while let Some(response) = device.send() {
            mailbox.receive(&response);
        }

        mailbox.process_timeouts(now);
    }
}

#[test]
fn serial_number_upload() {
    let mut dictionary = SimpleDictionary::default();

    dictionary.insert(0x1018, 4, &[0x12, 0x34, 0x56, 0x78]);

    let mut device = ResponseMailbox::new(
        config(),
        Box::new(dictionary),
        Box::new(MemoryFileStore::default()),
    );

    let mut mailbox = Mailbox::new(0x1001, config());

    let handle = mailbox.create_sdo_upload(0x1018, 4, false, 32, TIMEOUT);

    pump(&mut mailbox, &mut device);

    assert_eq!(handle.status(), MessageStatus::Success);
    assert_eq!(handle.data(), vec![0x12, 0x34, 0x56, 0x78]);
}

#[test]
fn device_name_segmented_upload() {
    let name = b"left motion controller board v2";

    let mut dictionary = SimpleDictionary::default();

    dictionary.insert(0x1008, 0, name);

    let mut device = ResponseMailbox::new(
        config(),
        Box::new(dictionary),
        Box::new(MemoryFileStore::default()),
    );

    let mut mailbox = Mailbox::new(0x1001, config());

    let handle = mailbox.create_sdo_upload(0x1008, 0, false, 64, TIMEOUT);

    pump(&mut mailbox, &mut device);

    assert_eq!(handle.status(), MessageStatus::Success);
    assert_eq!(handle.data(), name.to_vec());
}

#[test]
fn missing_object_aborts_with_readable_code() {
    let mut device = ResponseMailbox::new(
        config(),
        Box::new(SimpleDictionary::default()),
        Box::new(MemoryFileStore::default()),
    );

    let mut mailbox = Mailbox::new(0x1001, config());

    let handle = mailbox.create_sdo_upload(0x6000, 1, false, 32, TIMEOUT);

    pump(&mut mailbox, &mut device);

    match handle.status() {
        MessageStatus::Failed(MailboxError::Aborted { code, index, subindex }) => {
            assert_eq!(u32::from(code), 0x0602_0000);
            assert_eq!(index, 0x6000);
            assert_eq!(subindex, 1);
            assert!(code.description().starts_with("Object does not exist"));
        }
        other => panic!("expected abort, got {:?}", other),
    }
}

#[test]
fn firmware_download_via_foe() {
    let firmware: Vec<u8> = (0u8..=255).cycle().take(1000).collect();

    let mut device = ResponseMailbox::new(
        config(),
        Box::new(SimpleDictionary::default()),
        Box::new(MemoryFileStore::default()),
    );

    let mut mailbox = Mailbox::new(0x1001, config());

    let write = mailbox.create_write_file("app.bin", 0x1234, &firmware, TIMEOUT);

    pump(&mut mailbox, &mut device);

    assert_eq!(write.status(), MessageStatus::Success);

    let read = mailbox.create_read_file("app.bin", 0x1234, TIMEOUT);

    pump(&mut mailbox, &mut device);

    assert_eq!(read.status(), MessageStatus::Success);
    assert_eq!(read.data(), firmware);
}
