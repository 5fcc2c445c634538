//! Tax-document validation: digit stripping, kind detection, checksums.

use crate::models::DocumentKind;

/// Strip everything but ASCII digits.
pub fn strip_non_digits(input: &str) -> String {
    input.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Detect the document kind by digit count.
pub fn detect_kind(digits: &str) -> DocumentKind {
    match digits.len() {
        14 => DocumentKind::Cnpj,
        11 => DocumentKind::Cpf,
        _ => DocumentKind::Invalid,
    }
}

/// Mod-11 check for CPF (11 digits). Rejects same-digit sequences.
pub fn cpf_checksum_valid(digits: &str) -> bool {
    if digits.len() != 11 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let d: Vec<u32> = digits.chars().map(|c| c.to_digit(10).unwrap()).collect();
    if d.iter().all(|&x| x == d[0]) {
        return false;
    }

    let verifier = |take: usize| -> u32 {
        let weight_start = (take + 1) as u32;
        let sum: u32 = d[..take]
            .iter()
            .enumerate()
            .map(|(i, &x)| x * (weight_start - i as u32))
            .sum();
        let rem = (sum * 10) % 11;
        if rem == 10 {
            0
        } else {
            rem
        }
    };

    verifier(9) == d[9] && verifier(10) == d[10]
}

/// Mod-11 check for CNPJ (14 digits). Rejects same-digit sequences.
pub fn cnpj_checksum_valid(digits: &str) -> bool {
    if digits.len() != 14 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let d: Vec<u32> = digits.chars().map(|c| c.to_digit(10).unwrap()).collect();
    if d.iter().all(|&x| x == d[0]) {
        return false;
    }

    const W1: [u32; 12] = [5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
    const W2: [u32; 13] = [6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];

    let dv = |weights: &[u32]| -> u32 {
        let sum: u32 = weights.iter().zip(d.iter()).map(|(w, x)| w * x).sum();
        let rem = sum % 11;
        if rem < 2 {
            0
        } else {
            11 - rem
        }
    };

    dv(&W1) == d[12] && dv(&W2) == d[13]
}

/// Checksum dispatch by kind.
pub fn checksum_valid(digits: &str, kind: DocumentKind) -> bool {
    match kind {
        DocumentKind::Cnpj => cnpj_checksum_valid(digits),
        DocumentKind::Cpf => cpf_checksum_valid(digits),
        DocumentKind::Invalid => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_formatting() {
        assert_eq!(strip_non_digits("11.222.333/0001-81"), "11222333000181");
        assert_eq!(strip_non_digits("529.982.247-25"), "52998224725");
        assert_eq!(strip_non_digits("abc"), "");
    }

    #[test]
    fn detects_kind_by_length() {
        assert_eq!(detect_kind("11222333000181"), DocumentKind::Cnpj);
        assert_eq!(detect_kind("52998224725"), DocumentKind::Cpf);
        assert_eq!(detect_kind("12345"), DocumentKind::Invalid);
        assert_eq!(detect_kind(""), DocumentKind::Invalid);
    }

    #[test]
    fn cpf_checksum() {
        assert!(cpf_checksum_valid("52998224725"));
        assert!(!cpf_checksum_valid("52998224724"));
        assert!(!cpf_checksum_valid("11111111111"));
        assert!(!cpf_checksum_valid("123"));
    }

    #[test]
    fn cnpj_checksum() {
        assert!(cnpj_checksum_valid("11222333000181"));
        assert!(!cnpj_checksum_valid("11222333000182"));
        assert!(!cnpj_checksum_valid("00000000000000"));
    }
}
