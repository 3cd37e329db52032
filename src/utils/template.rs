use handlebars::{Handlebars, RenderError, TemplateError};
use serde::Serialize;
use tracing::debug;

pub const DOMAIN_XML: &str = "libvirt-domain";

const DOMAIN_XML_TEMPLATE: &str = r#"<domain type='{{domain_type}}'>
  <name>{{name}}</name>
  <uuid>{{uuid}}</uuid>
  <memory unit='MiB'>{{memory_mb}}</memory>
  <currentMemory unit='MiB'>{{memory_mb}}</currentMemory>
  <vcpu placement='static'>{{cpus}}</vcpu>
  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
{{#if iso}}
    <boot dev='cdrom'/>
{{/if}}
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
{{#if windows}}
    <hyperv mode='custom'>
      <relaxed state='on'/>
      <vapic state='on'/>
      <spinlocks state='on' retries='8191'/>
    </hyperv>
{{/if}}
  </features>
  <cpu mode='host-passthrough' check='none'/>
  <clock offset='{{#if windows}}localtime{{else}}utc{{/if}}'/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{{disk}}'/>
      <target dev='{{disk_bus_dev}}' bus='{{disk_bus}}'/>
    </disk>
{{#if iso}}
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{{iso}}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
{{/if}}
{{#each interfaces}}
    <interface type='{{this.kind}}'>
      <source {{this.source_attr}}='{{this.source}}'/>
      <model type='{{this.model}}'/>
    </interface>
{{/each}}
    <graphics type='vnc' port='-1' autoport='yes' listen='127.0.0.1'/>
    <video>
      <model type='virtio'/>
    </video>
    <console type='pty'/>
    <channel type='unix'>
      <target type='virtio' name='org.qemu.guest_agent.0'/>
    </channel>
  </devices>
</domain>
"#;

/// Renders the documents handed to hypervisor tools.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

impl TemplateEngine {
    pub fn new() -> Result<Self, TemplateError> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        handlebars.register_template_string(DOMAIN_XML, DOMAIN_XML_TEMPLATE)?;
        Ok(Self { handlebars })
    }

    /// Render a registered template. Values are XML-escaped.
    pub fn render<T: Serialize>(&self, name: &str, context: &T) -> Result<String, RenderError> {
        debug!("rendering template {}", name);
        self.handlebars.render(name, context)
    }
}
