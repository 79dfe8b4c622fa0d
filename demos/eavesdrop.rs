// qkd-shield/demos/eavesdrop.rs

// Intercept-resend attack raising the QBER and locking decryption out.
use qkd_shield::{QkdError, QkdService, ServiceConfig};
use serde_json::json;
use std::error::Error;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    println!("--- BB84 Eavesdropping Example ---");
    let service = QkdService::with_seed(ServiceConfig::default(), 20250330)?;

    // 1. Establish a key on a clean channel, retrying until one is accepted
    println!("\n[1] Establishing a key on a clean channel...");
    let mut attempts = 0;
    loop {
        attempts += 1;
        let report = service.generate_key(200)?;
        if report.final_key_length > 0 {
            println!("    Accepted after {} run(s), QBER {:.2}%", attempts, report.metrics.qber);
            break;
        }
    }
    let envelope = service.encrypt_record(&json!({"patient_id": "P002", "medication": "Insulin"}))?;
    println!("    Record encrypted, tag {}", envelope.tag);

    // 2. Turn on the interceptor and run again
    for strategy in ["random", "z_only", "x_only", "beam_splitter"] {
        let attack = service.simulate_attack(true, strategy);
        let report = service.generate_key(200)?;
        println!(
            "\n[2] Eve ({} -> {}): QBER {:.2}%, status {:?}, eve detected: {}",
            strategy, attack.strategy, report.metrics.qber, report.status, report.eve_detected
        );
        if let Some(stats) = &report.attack_stats {
            println!(
                "    Intercepted {} qubits (Z: {}, X: {})",
                stats.qubits_intercepted, stats.z_basis_used, stats.x_basis_used
            );
        }
    }

    // 3. The old key is still resident, but the gate refuses to use it
    println!("\n[3] Attempting to decrypt with the stale key...");
    match service.decrypt(&envelope) {
        Err(QkdError::CompromisedChannel { qber, threshold }) => {
            println!("    Blocked as expected: QBER {:.2}% > {:.2}%", qber, threshold);
        }
        Ok(_) => println!("    Unexpected: decryption succeeded on a compromised channel"),
        Err(e) => println!("    Decryption failed: {}", e),
    }

    // 4. Dashboard
    let dashboard = service.dashboard();
    println!(
        "\n[4] Sessions: {}, average QBER: {:.2}%, critical threats: {}",
        dashboard.total_sessions, dashboard.average_qber, dashboard.threat_summary.critical
    );

    println!("\n--- Example Complete ---");
    Ok(())
}
