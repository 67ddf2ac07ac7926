#[cfg(test)]
mod tests {
    struct Entry {
        name: &'static str,
        code: u16,
        mnemonic: &'static str,
        fields: &'static [&'static str],
    }

    macro_rules! list_isa {
        (
            $( $(#[$doc:meta])* $name:ident = $code:literal, $mnemonic:literal => [ $( $field:ident : $kind:ident ),* $(,)? ] ),* $(,)?
        ) => {
            &[
                $(
                    Entry {
                        name: stringify!($name),
                        code: $code,
                        mnemonic: $mnemonic,
                        fields: &[ $( stringify!($field) ),* ],
                    },
                )*
            ]
        };
    }

    const ISA: &[Entry] = crate::for_each_instruction!(list_isa);

    #[test]
    fn codes_are_dense_from_zero() {
        for (i, entry) in ISA.iter().enumerate() {
            assert_eq!(entry.code as usize, i, "{} is out of order", entry.name);
        }
    }

    #[test]
    fn codes_fit_beside_the_mode_bits() {
        let max = u16::MAX >> crate::virtual_machine::isa::MODE_BITS;
        assert!(ISA.iter().all(|entry| entry.code <= max));
    }

    #[test]
    fn abort_is_code_zero() {
        assert_eq!(ISA[0].name, "Abort");
        assert_eq!(ISA[0].mnemonic, "ABORT");
    }

    #[test]
    fn mnemonics_are_unique_upper_snake() {
        for (i, entry) in ISA.iter().enumerate() {
            assert!(
                entry
                    .mnemonic
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c == '_'),
                "{}",
                entry.mnemonic
            );
            assert!(
                ISA[..i].iter().all(|other| other.mnemonic != entry.mnemonic),
                "duplicate mnemonic {}",
                entry.mnemonic
            );
        }
    }

    #[test]
    fn operands_are_named_in_slot_order() {
        const SLOTS: [&str; 3] = ["a", "b", "c"];
        for entry in ISA {
            assert!(entry.fields.len() <= 3, "{}", entry.name);
            assert_eq!(entry.fields, &SLOTS[..entry.fields.len()], "{}", entry.name);
        }
    }
}
