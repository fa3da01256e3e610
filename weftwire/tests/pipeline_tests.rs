//! Wire-level receive pipeline tests: frames travel through the codec and
//! the sequencer exactly as they would off the socket.

use bytes::Bytes;
use weftwire::{Ack, Channel, ChunkInfo, Delivery, Frame, Sequencer};

fn wire_data(channel: Channel, seq: u16, payload: &'static [u8]) -> Vec<u8> {
    Frame::Data {
        channel,
        seq,
        chunk: None,
        sender: 2,
        dest: 0,
        module_id: Bytes::from_static(&[0x01]),
        payload: Bytes::from_static(payload),
    }
    .encode()
    .to_vec()
}

fn wire_slice(seq: u16, index: u16, count: u16, payload: &'static [u8]) -> Vec<u8> {
    Frame::Data {
        channel: Channel::ReliableOrdered,
        seq,
        chunk: Some(ChunkInfo { index, count }),
        sender: 2,
        dest: 0,
        module_id: Bytes::from_static(&[0x01]),
        payload: Bytes::from_static(payload),
    }
    .encode()
    .to_vec()
}

#[test]
fn decoded_frames_release_in_sequence_order() {
    let mut sequencer = Sequencer::new();
    let mut released = Vec::new();

    for seq in [3u16, 1, 4, 2, 5] {
        let frame = Frame::decode(&wire_data(Channel::ReliableOrdered, seq, b"p")).unwrap();
        let out = sequencer.ingest(frame).unwrap();
        for delivery in out.deliveries {
            match delivery {
                Delivery::Data { seq, .. } => released.push(seq),
                Delivery::PeerInfo { .. } => unreachable!(),
            }
        }
    }

    assert_eq!(released, vec![1, 2, 3, 4, 5]);
    assert_eq!(sequencer.reliable_remote(), 5);
}

#[test]
fn three_slice_message_survives_the_codec() {
    let mut sequencer = Sequencer::new();

    // Slices arrive 2, 0, 1.
    let out = sequencer
        .ingest(Frame::decode(&wire_slice(1, 2, 3, b"CC")).unwrap())
        .unwrap();
    assert_eq!(out.acks, vec![Ack { seq: 1, slice: Some(2) }]);
    assert!(out.deliveries.is_empty());

    sequencer
        .ingest(Frame::decode(&wire_slice(1, 0, 3, b"AA")).unwrap())
        .unwrap();
    let out = sequencer
        .ingest(Frame::decode(&wire_slice(1, 1, 3, b"BB")).unwrap())
        .unwrap();

    assert_eq!(out.deliveries.len(), 1);
    match &out.deliveries[0] {
        Delivery::Data { payload, seq, .. } => {
            assert_eq!(payload.as_ref(), b"AABBCC");
            assert_eq!(*seq, 1);
        }
        Delivery::PeerInfo { .. } => panic!("expected data"),
    }
}

#[test]
fn acks_round_trip_for_every_reliable_frame() {
    let mut sequencer = Sequencer::new();
    for seq in [5u16, 2, 9, 2] {
        let frame = Frame::decode(&wire_data(Channel::ReliableUnordered, seq, b"u")).unwrap();
        let out = sequencer.ingest(frame).unwrap();
        assert_eq!(out.acks.len(), 1);

        // The ACK itself must survive its own trip over the wire.
        let ack = Frame::Ack {
            seq: out.acks[0].seq,
            slice: out.acks[0].slice,
        };
        assert_eq!(Frame::decode(&ack.encode()).unwrap(), ack);
    }
}

#[test]
fn corrupted_datagram_never_reaches_the_sequencer() {
    let mut wire = wire_data(Channel::ReliableOrdered, 1, b"p");
    let last = wire.len() - 1;
    wire[last] ^= 0x40;
    assert!(Frame::decode(&wire).is_err());
}
