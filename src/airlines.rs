use once_cell::sync::Lazy;
use std::collections::HashMap;

/// IATA (2-letter) to ICAO (3-letter) airline designators for carriers that
/// commonly show up in the states feed. Callsigns are filed with either
/// prefix depending on the data source, so both spellings are indexed.
static AIRLINE_CODES: &[(&str, &str)] = &[
    ("AA", "AAL"), // American Airlines
    ("AC", "ACA"), // Air Canada
    ("AF", "AFR"), // Air France
    ("AI", "AIC"), // Air India
    ("AM", "AMX"), // Aeromexico
    ("AR", "ARG"), // Aerolineas Argentinas
    ("AS", "ASA"), // Alaska Airlines
    ("AV", "AVA"), // Avianca
    ("AY", "FIN"), // Finnair
    ("BA", "BAW"), // British Airways
    ("BR", "EVA"), // EVA Air
    ("CA", "CCA"), // Air China
    ("CI", "CAL"), // China Airlines
    ("CM", "CMP"), // Copa Airlines
    ("CX", "CPA"), // Cathay Pacific
    ("CZ", "CSN"), // China Southern
    ("DE", "CFG"), // Condor
    ("DL", "DAL"), // Delta Air Lines
    ("DY", "NAX"), // Norwegian Air Shuttle
    ("EI", "EIN"), // Aer Lingus
    ("EK", "UAE"), // Emirates
    ("ET", "ETH"), // Ethiopian Airlines
    ("EY", "ETD"), // Etihad Airways
    ("FI", "ICE"), // Icelandair
    ("FR", "RYR"), // Ryanair
    ("GA", "GIA"), // Garuda Indonesia
    ("HA", "HAL"), // Hawaiian Airlines
    ("IB", "IBE"), // Iberia
    ("JL", "JAL"), // Japan Airlines
    ("KE", "KAL"), // Korean Air
    ("KL", "KLM"), // KLM
    ("LA", "LAN"), // LATAM
    ("LH", "DLH"), // Lufthansa
    ("LO", "LOT"), // LOT Polish Airlines
    ("LX", "SWR"), // Swiss
    ("MH", "MAS"), // Malaysia Airlines
    ("MS", "MSR"), // Egyptair
    ("MU", "CES"), // China Eastern
    ("NH", "ANA"), // All Nippon Airways
    ("NK", "NKS"), // Spirit Airlines
    ("NZ", "ANZ"), // Air New Zealand
    ("OS", "AUA"), // Austrian Airlines
    ("OZ", "AAR"), // Asiana Airlines
    ("PR", "PAL"), // Philippine Airlines
    ("QF", "QFA"), // Qantas
    ("QR", "QTR"), // Qatar Airways
    ("SK", "SAS"), // SAS
    ("SN", "BEL"), // Brussels Airlines
    ("SQ", "SIA"), // Singapore Airlines
    ("SU", "AFL"), // Aeroflot
    ("SV", "SVA"), // Saudia
    ("TG", "THA"), // Thai Airways
    ("TK", "THY"), // Turkish Airlines
    ("TP", "TAP"), // TAP Air Portugal
    ("UA", "UAL"), // United Airlines
    ("UX", "AEA"), // Air Europa
    ("VA", "VOZ"), // Virgin Australia
    ("VN", "HVN"), // Vietnam Airlines
    ("VS", "VIR"), // Virgin Atlantic
    ("WN", "SWA"), // Southwest Airlines
    ("WS", "WJA"), // WestJet
];

static IATA_TO_ICAO: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| AIRLINE_CODES.iter().copied().collect());

static ICAO_TO_IATA: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| AIRLINE_CODES.iter().map(|&(iata, icao)| (icao, iata)).collect());

/// Derive the alternate spelling of a callsign by swapping its airline
/// prefix between IATA and ICAO designators. The prefix is the leading run
/// of ASCII uppercase letters; it converts only when it is exactly 2 or 3
/// letters and present in the table. `None` when no alternate exists.
pub fn alternate_callsign(callsign: &str) -> Option<String> {
    let prefix_len = callsign
        .bytes()
        .take_while(|b| b.is_ascii_uppercase())
        .count();
    let (prefix, suffix) = callsign.split_at(prefix_len);

    let swapped = match prefix_len {
        2 => IATA_TO_ICAO.get(prefix)?,
        3 => ICAO_TO_IATA.get(prefix)?,
        _ => return None,
    };
    Some(format!("{swapped}{suffix}"))
}
