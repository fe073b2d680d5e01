use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use keypool_core::{
    Credential, CredentialAdmin, FallbackCredential, FileCredentialStore, HealthReport, MasterKey,
    PoolSettings, RotationManager, SettingsManager, Vault, VaultState,
};

use crate::Command;

pub(crate) async fn run(command: Command, data_dir: PathBuf, passphrase: Option<String>) -> anyhow::Result<()> {
    let store = Arc::new(
        FileCredentialStore::with_dir(data_dir.clone())
            .with_context(|| format!("cannot open data directory {:?}", data_dir))?,
    );
    let mut settings = SettingsManager::new(&data_dir)?;
    let mut vault = Vault::new(&data_dir);

    match command {
        Command::Init => {
            if vault.state() != VaultState::NotInitialized {
                bail!("vault already exists in {:?}", data_dir);
            }
            let passphrase = new_passphrase(passphrase)?;
            vault.initialize(&passphrase).await?;
            println!("Vault created in {}", data_dir.display());
        }

        Command::Settings {
            cooldown_secs,
            disable_threshold,
            refresh_interval_secs,
            default_rpm,
            fallback_env,
            reset,
        } => {
            if reset {
                settings.reset().await?;
            } else {
                let mut updated = settings.get().clone();
                let mut changed = false;
                if let Some(value) = cooldown_secs {
                    updated.cooldown_secs = value;
                    changed = true;
                }
                if let Some(value) = disable_threshold {
                    updated.disable_threshold = value;
                    changed = true;
                }
                if let Some(value) = refresh_interval_secs {
                    updated.refresh_interval_secs = value;
                    changed = true;
                }
                if let Some(value) = default_rpm {
                    updated.default_rpm_limit = value;
                    changed = true;
                }
                if let Some(value) = fallback_env {
                    updated.fallback_env = value;
                    changed = true;
                }
                if changed {
                    settings.update(updated).await?;
                    info!("Settings updated");
                }
            }
            println!("{}", serde_json::to_string_pretty(settings.get())?);
        }

        Command::Passwd => {
            let old = match passphrase {
                Some(p) => p,
                None => rpassword::prompt_password("Current passphrase: ")?,
            };
            let new = new_passphrase(None)?;
            let count = store_len(&store).await?;
            vault.change_passphrase(&old, &new, store.as_ref()).await?;
            println!("Passphrase changed, {} keys resealed", count);
        }

        command => {
            let master_key = unlock(&mut vault, passphrase).await?;
            run_unlocked(command, store, master_key, settings.get().clone()).await?;
        }
    }

    Ok(())
}

async fn run_unlocked(
    command: Command,
    store: Arc<FileCredentialStore>,
    master_key: MasterKey,
    settings: PoolSettings,
) -> anyhow::Result<()> {
    let admin = CredentialAdmin::new(store.clone(), master_key.clone());

    match command {
        Command::Add {
            label,
            provider,
            priority,
            rpm,
            key,
        } => {
            let secret = read_key(key)?;
            let rpm = rpm.unwrap_or(settings.default_rpm_limit);
            let credential = admin.add_key(&label, &provider, &secret, priority, rpm).await?;
            println!("Added {} ({} ...{})", credential.id, credential.label, credential.hint);
        }

        Command::List => {
            let credentials = admin.list().await?;
            if credentials.is_empty() {
                println!("Pool is empty");
            }
            for credential in &credentials {
                print_credential(credential);
            }
        }

        Command::Health { json } => {
            let manager = manager(store, master_key, settings);
            let reports = manager.health().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for report in &reports {
                    print_health(report);
                }
            }
        }

        Command::Reset { id } => {
            let credential = admin.reset_errors(id).await?;
            print_credential(&credential);
        }

        Command::Enable { id } => {
            let credential = admin.enable(id).await?;
            print_credential(&credential);
        }

        Command::Disable { id } => {
            let credential = admin.disable(id).await?;
            print_credential(&credential);
        }

        Command::Remove { id } => {
            admin.delete(id).await?;
            println!("Removed {}", id);
        }

        Command::Priority { id, priority } => {
            let credential = admin.set_priority(id, priority).await?;
            print_credential(&credential);
        }

        Command::Rpm { id, limit } => {
            let credential = admin.set_rpm_limit(id, limit).await?;
            print_credential(&credential);
        }

        Command::Replace { id, key } => {
            let secret = read_key(key)?;
            let credential = admin.update_secret(id, &secret).await?;
            print_credential(&credential);
        }

        Command::Acquire { count } => {
            let manager = manager(store, master_key, settings);
            for n in 1..=count {
                let lease = manager.acquire().await?;
                match lease.credential() {
                    Some(credential) => {
                        println!("{:>3}  {}  {} ...{}", n, credential.id, credential.label, lease.hint())
                    }
                    None => println!("{:>3}  fallback ...{}", n, lease.hint()),
                }
            }
        }

        other => bail!("{:?} runs without an unlocked vault", other),
    }

    Ok(())
}

fn manager(store: Arc<FileCredentialStore>, master_key: MasterKey, settings: PoolSettings) -> RotationManager {
    let fallback = FallbackCredential::from_env(&settings.fallback_env);
    RotationManager::new(store, master_key)
        .with_settings(settings)
        .with_fallback(fallback)
}

async fn unlock(vault: &mut Vault, passphrase: Option<String>) -> anyhow::Result<MasterKey> {
    if vault.state() == VaultState::NotInitialized {
        bail!("no vault found - run `keypool init` first");
    }
    let passphrase = match passphrase {
        Some(p) => p,
        None => rpassword::prompt_password("Vault passphrase: ")?,
    };
    Ok(vault.unlock(&passphrase).await?)
}

fn new_passphrase(given: Option<String>) -> anyhow::Result<String> {
    if let Some(passphrase) = given {
        return Ok(passphrase);
    }
    let first = rpassword::prompt_password("New passphrase: ")?;
    let second = rpassword::prompt_password("Repeat passphrase: ")?;
    if first != second {
        bail!("passphrases do not match");
    }
    if first.len() < 8 {
        bail!("passphrase must be at least 8 characters");
    }
    Ok(first)
}

fn read_key(given: Option<String>) -> anyhow::Result<String> {
    match given {
        Some(key) => Ok(key),
        None => Ok(rpassword::prompt_password("API key: ")?),
    }
}

async fn store_len(store: &FileCredentialStore) -> anyhow::Result<usize> {
    use keypool_core::CredentialStore;
    Ok(store.list().await?.len())
}

fn print_credential(credential: &Credential) {
    println!(
        "{}  {:<20} {:<10} ...{:<4}  prio {:<3} rpm {:<4} {:<8} errors {}",
        credential.id,
        credential.label,
        credential.provider,
        credential.hint,
        credential.priority,
        credential.rpm_limit,
        credential.status,
        credential.error_count,
    );
}

fn print_health(report: &HealthReport) {
    let rpm = match report.rpm_limit {
        Some(limit) => format!("{}/{}", report.requests_this_minute, limit),
        None => "-".to_string(),
    };
    let availability = if report.is_available { "available" } else { "unavailable" };

    println!(
        "{:<20} ...{:<4} {:<8} {:<11} rpm {:<9} errors {:<2} requests {:<6} latency {}ms{}",
        report.label,
        report.hint,
        report.status,
        availability,
        rpm,
        report.error_count,
        report.total_requests,
        report.last_latency_ms,
        cooldown_note(report.cooldown_until),
    );
    if let Some(error) = &report.last_error {
        println!("    last error: {}", error);
    }
}

fn cooldown_note(until: Option<DateTime<Utc>>) -> String {
    match until {
        Some(until) => {
            let remaining = (until - Utc::now()).num_seconds().max(0);
            format!("  cooling {}s", remaining)
        }
        None => String::new(),
    }
}
