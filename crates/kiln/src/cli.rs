//! Kiln CLI.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use futures::FutureExt;
use kiln_driver::{ContainerId, DockerDriver, Driver, DriverConfig, ImageId, with_login};
use tokio::fs::File;

/// Kiln - container build environment driver
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Driver config file (defaults to the user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Runtime binary, overriding the config file
    #[arg(long, global = true, env = "KILN_DOCKER_BINARY")]
    pub binary: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Kiln commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Check that the runtime is usable
    Verify,

    /// Print the runtime client version
    Version,

    /// Pull an image
    Pull {
        /// Image reference
        image: String,

        /// Target platform (e.g. linux/arm64)
        #[arg(long)]
        platform: Option<String>,
    },

    /// Push an image, optionally inside a registry session
    Push {
        /// Image reference
        name: String,

        /// Target platform
        #[arg(long)]
        platform: Option<String>,

        /// Registry username
        #[arg(long, env = "KILN_REGISTRY_USERNAME", requires = "password")]
        username: Option<String>,

        /// Registry password
        #[arg(long, env = "KILN_REGISTRY_PASSWORD", hide_env_values = true, requires = "username")]
        password: Option<String>,
    },

    /// Add a reference to an image
    Tag {
        /// Image ID or reference
        image: String,

        /// New reference
        repo: String,

        /// Rebind the reference if it points elsewhere
        #[arg(short, long)]
        force: bool,
    },

    /// Commit a container into an image
    Commit {
        /// Container ID
        container: String,

        /// Image author
        #[arg(long, default_value = "")]
        author: String,

        /// Commit message
        #[arg(short, long, default_value = "")]
        message: String,

        /// Image config change (e.g. 'ENV K=V'), repeatable
        #[arg(short, long = "change")]
        changes: Vec<String>,
    },

    /// Export a container filesystem as a tar archive
    Export {
        /// Container ID
        container: String,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Save an image as a tar archive
    Save {
        /// Image ID or reference
        image: String,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Import a filesystem archive as an image
    Import {
        /// Archive path
        path: PathBuf,

        /// Reference to tag the image with
        repo: String,

        /// Image config change, repeatable
        #[arg(short, long = "change")]
        changes: Vec<String>,

        /// Target platform
        #[arg(long)]
        platform: Option<String>,
    },

    /// Remove an image
    Rmi {
        /// Image ID or reference
        image: String,
    },

    /// Show the content and registry digests of an image
    Inspect {
        /// Image ID or reference
        image: String,

        /// Format output as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    /// Driver configuration from the config file and flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed.
    pub fn driver_config(&self) -> Result<DriverConfig> {
        let mut config = DriverConfig::discover(self.config.as_deref())
            .wrap_err("Failed to load driver config")?;
        if let Some(binary) = &self.binary {
            config = config.with_binary(binary);
        }
        Ok(config)
    }

    /// Execute the CLI command against a docker-compatible runtime.
    ///
    /// # Errors
    ///
    /// Returns the driver error of the failed operation.
    pub async fn execute(self) -> Result<()> {
        let config = self.driver_config()?;
        tracing::debug!(binary = %config.binary.display(), "Using runtime");

        let driver = DockerDriver::new(config);
        self.command.run(&driver).await
    }
}

impl Commands {
    /// Run the command against `driver`.
    ///
    /// # Errors
    ///
    /// Returns the driver error of the failed operation.
    pub async fn run(self, driver: &dyn Driver) -> Result<()> {
        match self {
            Self::Verify => {
                driver.verify().await?;
                println!("Runtime OK");
            }

            Self::Version => {
                println!("{}", driver.version().await?);
            }

            Self::Pull { image, platform } => {
                driver.pull(&image, platform.as_deref()).await?;
                println!("Pulled {image}");
            }

            Self::Push {
                name,
                platform,
                username,
                password,
            } => {
                let (name_ref, platform) = (name.as_str(), platform.as_deref());
                match (username, password) {
                    (Some(username), Some(password)) => {
                        with_login(driver, name_ref, &username, &password, |driver| {
                            async move { driver.push(name_ref, platform).await }.boxed()
                        })
                        .await?;
                    }
                    _ => driver.push(name_ref, platform).await?,
                }
                println!("Pushed {name}");
            }

            Self::Tag { image, repo, force } => {
                driver.tag_image(&ImageId::new(image), &repo, force).await?;
                println!("Tagged {repo}");
            }

            Self::Commit {
                container,
                author,
                message,
                changes,
            } => {
                let id = ContainerId::new(container)?;
                let image = driver.commit(&id, &author, &changes, &message).await?;
                println!("{image}");
            }

            Self::Export { container, output } => {
                let id = ContainerId::new(container)?;
                match output {
                    Some(path) => {
                        let mut file = create(&path).await?;
                        driver.export(&id, &mut file).await?;
                    }
                    None => driver.export(&id, &mut tokio::io::stdout()).await?,
                }
            }

            Self::Save { image, output } => {
                let id = ImageId::new(image);
                match output {
                    Some(path) => {
                        let mut file = create(&path).await?;
                        driver.save_image(&id, &mut file).await?;
                    }
                    None => driver.save_image(&id, &mut tokio::io::stdout()).await?,
                }
            }

            Self::Import {
                path,
                repo,
                changes,
                platform,
            } => {
                let image = driver
                    .import(&path, &changes, &repo, platform.as_deref())
                    .await?;
                println!("{image}");
            }

            Self::Rmi { image } => {
                driver.delete_image(&ImageId::new(image.as_str())).await?;
                println!("Deleted {image}");
            }

            Self::Inspect { image, json } => {
                let id = ImageId::new(image);
                let sha256 = driver.sha256(&id).await?;
                let digest = driver.digest(&id).await?;

                if json {
                    let output = serde_json::json!({
                        "image": id.as_str(),
                        "sha256": sha256.to_string(),
                        "repoDigest": digest.as_ref().map(ToString::to_string),
                    });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                } else {
                    println!("Image:       {id}");
                    println!("Sha256:      {sha256}");
                    match digest {
                        Some(digest) => println!("Repo digest: {digest}"),
                        None => println!("Repo digest: <never pushed>"),
                    }
                }
            }
        }

        Ok(())
    }
}

async fn create(path: &Path) -> Result<File> {
    File::create(path)
        .await
        .wrap_err_with(|| format!("Failed to create {}", path.display()))
}
