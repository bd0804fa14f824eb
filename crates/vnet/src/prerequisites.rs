use crate::command::{Privilege, exec};
use crate::context::Context;
use crate::error::{NetError, Result};
use crate::scheme::Scheme;

/// Verify that everything reconciling `scheme` needs is present.
///
/// Checks the external programs the topology uses, the process output
/// directory and, when commands go through sudo, non-interactive sudo access.
/// Collects all failures and returns them in a single `PreconditionMissing`.
pub async fn check_prerequisites(
    scheme: &Scheme,
    ctx: &Context,
    privilege: Privilege,
) -> Result<()> {
    let mut errors = Vec::new();

    check_required_commands(scheme, ctx, &mut errors);
    check_output_dir(ctx, &mut errors);
    if privilege == Privilege::Sudo {
        check_sudo(&mut errors).await;
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(NetError::PreconditionMissing(errors.join("; ")))
    }
}

fn check_required_commands(scheme: &Scheme, ctx: &Context, errors: &mut Vec<String>) {
    for cmd in scheme.required_commands() {
        if ctx.exec().resolve(cmd).is_none() {
            errors.push(format!("required command not found: {cmd}"));
        }
    }
}

fn check_output_dir(ctx: &Context, errors: &mut Vec<String>) {
    let dir = ctx.output_dir();
    if !dir.is_dir() {
        errors.push(format!("output directory not found: {}", dir.display()));
    }
}

async fn check_sudo(errors: &mut Vec<String>) {
    if exec("sudo", &["-n", "true"], Privilege::User)
        .await
        .is_err()
    {
        errors.push(
            "root/sudo access required for network configuration; \
             please run with sudo or configure sudoers"
                .to_string(),
        );
    }
}
