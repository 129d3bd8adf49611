pub mod event;

pub use event::decoder::{decode_log, DecodeError, RawLog};
pub use event::*;

#[cfg(test)]
mod tests {
    use super::*;

    fn word(last_byte: u8) -> [u8; 32] {
        let mut w = [0u8; 32];
        w[31] = last_byte;
        w
    }

    fn address_word(fill: u8) -> [u8; 32] {
        let mut w = [0u8; 32];
        w[12..].fill(fill);
        w
    }

    fn raw(topics: Vec<[u8; 32]>, data: Vec<u8>) -> RawLog {
        RawLog {
            block_height: 10,
            log_index: 3,
            address: Address([0xee; 20]),
            topics,
            data,
        }
    }

    #[test]
    fn test_key_orders_by_block_then_log_index() {
        let mut keys = vec![Key::new(12, 0), Key::new(10, 1), Key::new(10, 0)];
        keys.sort();
        assert_eq!(keys, vec![Key::new(10, 0), Key::new(10, 1), Key::new(12, 0)]);
        assert!(Key::new(9, u64::MAX) < Key::new(10, 0));
    }

    #[test]
    fn test_decode_signup() {
        let log = raw(
            vec![word(0xaa), address_word(0x11)],
            address_word(0x22).to_vec(),
        );
        let event = decode_log(EventCategory::Signup, &log).unwrap();
        assert_eq!(event.key, Key::new(10, 3));
        assert_eq!(
            event.payload,
            EventPayload::Signup {
                user: Address([0x11; 20]),
                token: Address([0x22; 20]),
            }
        );
        assert_eq!(event.category(), EventCategory::Signup);
    }

    #[test]
    fn test_decode_organization_signup() {
        let log = raw(vec![word(0xaa), address_word(0x33)], vec![]);
        let event = decode_log(EventCategory::OrganizationSignup, &log).unwrap();
        assert_eq!(
            event.payload,
            EventPayload::OrganizationSignup {
                organization: Address([0x33; 20]),
            }
        );
    }

    #[test]
    fn test_decode_trust() {
        let log = raw(
            vec![word(0xaa), address_word(0x01), address_word(0x02)],
            word(50).to_vec(),
        );
        let event = decode_log(EventCategory::Trust, &log).unwrap();
        assert_eq!(
            event.payload,
            EventPayload::Trust {
                can_send_to: Address([0x01; 20]),
                user: Address([0x02; 20]),
                limit: 50,
            }
        );
    }

    #[test]
    fn test_decode_trust_limit_overflow() {
        let mut limit = [0u8; 32];
        limit[0] = 1;
        let log = raw(
            vec![word(0xaa), address_word(0x01), address_word(0x02)],
            limit.to_vec(),
        );
        assert_eq!(
            decode_log(EventCategory::Trust, &log),
            Err(DecodeError::ValueOverflow { field: "limit" })
        );
    }

    #[test]
    fn test_decode_transfer_uses_emitter_as_token() {
        let mut amount = [0u8; 32];
        amount[30] = 0x01;
        amount[31] = 0x00;
        let log = raw(
            vec![word(0xaa), address_word(0x05), address_word(0x06)],
            amount.to_vec(),
        );
        let event = decode_log(EventCategory::Transfer, &log).unwrap();
        let EventPayload::Transfer {
            token,
            from,
            to,
            amount,
        } = event.payload
        else {
            panic!("expected transfer, got {:?}", event.payload);
        };
        assert_eq!(token, Address([0xee; 20]));
        assert_eq!(from, Address([0x05; 20]));
        assert_eq!(to, Address([0x06; 20]));
        assert_eq!(amount.to_string(), "0x100");
        assert_eq!(amount.to_u128(), Some(256));
    }

    #[test]
    fn test_decode_missing_topic() {
        let log = raw(vec![word(0xaa), address_word(0x05)], word(1).to_vec());
        assert_eq!(
            decode_log(EventCategory::Transfer, &log),
            Err(DecodeError::MissingTopic {
                expected: 3,
                found: 2
            })
        );
    }

    #[test]
    fn test_decode_short_data() {
        let log = raw(vec![word(0xaa), address_word(0x11)], vec![0u8; 16]);
        assert_eq!(
            decode_log(EventCategory::Signup, &log),
            Err(DecodeError::DataTooShort {
                expected: 32,
                found: 16
            })
        );
    }

    #[test]
    fn test_category_round_trips_through_str() {
        for category in EventCategory::ALL {
            assert_eq!(category.to_string().parse::<EventCategory>(), Ok(category));
        }
        assert!("hub_transfer".parse::<EventCategory>().is_err());
    }

    #[test]
    fn test_address_parse_and_display() {
        let address: Address = "0x00000000000000000000000000000000000000Ab".parse().unwrap();
        assert_eq!(
            address.to_string(),
            "0x00000000000000000000000000000000000000ab"
        );
        assert!("0x1234".parse::<Address>().is_err());
    }

    #[test]
    fn test_event_serializes_as_tagged_json() {
        let event = Event {
            key: Key::new(7, 1),
            address: Address([0; 20]),
            payload: EventPayload::OrganizationSignup {
                organization: Address([0x10; 20]),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["key"]["block_height"], 7);
        assert_eq!(json["payload"]["category"], "organization_signup");
        assert_eq!(
            json["payload"]["organization"],
            "0x1010101010101010101010101010101010101010"
        );
    }
}
